// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # kg-memory
//!
//! Durable knowledge-graph memory for agents: named entities carrying
//! observations, linked by typed relations, persisted in redb.
//!
//! ## Architecture
//!
//! - **Storage backend** (`store`): redb tables with unique and foreign-key
//!   constraints, atomic multi-statement transactions and MVCC snapshots
//! - **Graph manager** (`graph::manager`): validated single-item operations,
//!   one transaction per call
//! - **Optimized manager** (`graph::optimized`): write-through read cache and
//!   atomic batches
//! - **Tool front-end** (`tools`): strict per-tool JSON arguments over stdin/stdout
//!
//! ## Library usage
//!
//! ```no_run
//! use kg_memory::graph::{Entity, GraphManager, OptimizedGraphManager, Relation};
//! use kg_memory::store::Backend;
//!
//! let backend = Backend::open("memory.redb".as_ref(), std::time::Duration::from_secs(5)).unwrap();
//! let graph = OptimizedGraphManager::new(GraphManager::new(backend));
//! graph.create_entities(&[Entity::new("Alice", "Person"), Entity::new("Bob", "Person")]).unwrap();
//! graph.create_relations(&[Relation::new("Alice", "Bob", "knows")]).unwrap();
//! assert_eq!(graph.search_nodes("alice").unwrap().entities.len(), 1);
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod graph;
pub mod store;
pub mod tools;
