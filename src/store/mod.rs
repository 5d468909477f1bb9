//! Durable storage for the knowledge graph.
//!
//! The graph lives in a single redb database ([`Backend`]) organised as
//! fixed logical tables:
//!
//! - `entities`: name → type label and observation counter
//! - `observations`: (entity, sequence) → text, in insertion order
//! - `relations` and `relations_by_target`: the relation triple, indexed from
//!   both endpoints so cascading deletes never scan the whole table
//!
//! Writes are expressed as [`Statement`]s executed inside a [`Transaction`];
//! reads go through the [`GraphReader`] trait, implemented both by write
//! transactions (which see their own uncommitted statements) and by
//! read-only [`Snapshot`]s.

pub mod durable;

use std::collections::BTreeSet;

use crate::graph::{Entity, KnowledgeGraph, Relation};

pub use crate::error::StoreResult;
pub use durable::{Backend, Snapshot, Transaction};

/// A single write against the graph tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement<'a> {
    /// Insert a new entity row. Fails if the name is taken.
    InsertEntity { name: &'a str, entity_type: &'a str },
    /// Delete an entity with its observations and every relation touching it.
    DeleteEntity { name: &'a str },
    /// Append an observation. Fails if the entity is missing or already has it.
    InsertObservation { entity: &'a str, text: &'a str },
    /// Remove an observation if present.
    DeleteObservation { entity: &'a str, text: &'a str },
    /// Insert a relation. Fails if an endpoint is missing or the triple exists.
    InsertRelation(&'a Relation),
    /// Remove a relation triple if present.
    DeleteRelation(&'a Relation),
}

/// Read access to the graph tables.
pub trait GraphReader {
    /// Whether an entity with this exact name exists.
    fn entity_exists(&self, name: &str) -> StoreResult<bool>;

    /// Load one entity with its observations.
    fn entity(&self, name: &str) -> StoreResult<Option<Entity>>;

    /// Whether this exact relation triple exists.
    fn relation_exists(&self, relation: &Relation) -> StoreResult<bool>;

    /// Load every entity and relation.
    fn read_graph(&self) -> StoreResult<KnowledgeGraph>;

    /// Load the named entities and the relations among them.
    fn read_subgraph(&self, names: &BTreeSet<&str>) -> StoreResult<KnowledgeGraph>;
}
