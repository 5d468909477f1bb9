//! Knowledge graph data model and managers.
//!
//! The graph holds named [`Entity`] nodes carrying ordered observations, and
//! typed, directed [`Relation`] edges between them.
//!
//! - **Basic manager** ([`GraphManager`]): one backend transaction per call
//! - **Optimized manager** ([`OptimizedGraphManager`]): read cache + atomic batches
//!
//! Both hand out owned [`KnowledgeGraph`] values; callers never see the
//! backend rows or the cache directly.

pub mod batch;
pub mod manager;
pub mod optimized;
pub mod validate;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub use batch::{BatchOutcome, GraphBatch};
pub use manager::GraphManager;
pub use optimized::OptimizedGraphManager;

/// A uniquely named node with a type label and ordered observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Entity {
    /// Identity key, unique across the graph.
    pub name: String,
    /// Free-form type label (e.g. "Person").
    pub entity_type: String,
    /// Observation strings in insertion order, without duplicates.
    #[serde(default)]
    pub observations: Vec<String>,
}

impl Entity {
    /// Create an entity with no observations.
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            observations: Vec::new(),
        }
    }

    /// Set the initial observations.
    pub fn with_observations<I, S>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observations = observations.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive substring match against name, type and observations.
    ///
    /// `needle` must already be lowercased.
    fn matches(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self.entity_type.to_lowercase().contains(needle)
            || self
                .observations
                .iter()
                .any(|obs| obs.to_lowercase().contains(needle))
    }
}

/// A directed, typed edge identified by `(from, to, relation_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Relation {
    /// Source entity name.
    pub from: String,
    /// Target entity name.
    pub to: String,
    /// Edge label (e.g. "knows").
    pub relation_type: String,
}

impl Relation {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
        }
    }

    /// Whether either endpoint is `name`.
    pub fn touches(&self, name: &str) -> bool {
        self.from == name || self.to == name
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\" -[{}]-> \"{}\"", self.from, self.relation_type, self.to)
    }
}

/// Observations to append to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObservationAddition {
    pub entity_name: String,
    pub contents: Vec<String>,
}

impl ObservationAddition {
    pub fn new<I, S>(entity_name: impl Into<String>, contents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_name: entity_name.into(),
            contents: contents.into_iter().map(Into::into).collect(),
        }
    }
}

/// Observations to remove from one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObservationDeletion {
    pub entity_name: String,
    pub observations: Vec<String>,
}

impl ObservationDeletion {
    pub fn new<I, S>(entity_name: impl Into<String>, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_name: entity_name.into(),
            observations: observations.into_iter().map(Into::into).collect(),
        }
    }
}

/// The observations actually appended to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub entity_name: String,
    pub added_observations: Vec<String>,
}

/// How relation creation treats an endpoint that does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingEndpointPolicy {
    /// Leave the relation out of the result and carry on.
    #[default]
    Skip,
    /// Fail the whole call with `EntityNotFound`.
    Reject,
}

/// A view of entities and the relations among them.
///
/// Entities are ordered by name and relations by `(from, to, relation_type)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl KnowledgeGraph {
    /// Look up an entity by exact name.
    ///
    /// Does not rely on name order, so graphs deserialized from callers work too.
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entities matching `query` (case-insensitive substring on name, type or
    /// any observation) plus the relations whose endpoints both match.
    pub fn search(&self, query: &str) -> KnowledgeGraph {
        let needle = query.to_lowercase();
        let entities = self
            .entities
            .iter()
            .filter(|e| e.matches(&needle))
            .cloned()
            .collect();
        self.with_relations_among(entities)
    }

    /// The named entities (unknown names omitted) plus relations among them.
    pub fn open<S: AsRef<str>>(&self, names: &[S]) -> KnowledgeGraph {
        let wanted: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
        let entities = self
            .entities
            .iter()
            .filter(|e| wanted.contains(e.name.as_str()))
            .cloned()
            .collect();
        self.with_relations_among(entities)
    }

    fn with_relations_among(&self, entities: Vec<Entity>) -> KnowledgeGraph {
        let relations = {
            let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
            self.relations
                .iter()
                .filter(|r| names.contains(r.from.as_str()) && names.contains(r.to.as_str()))
                .cloned()
                .collect()
        };
        KnowledgeGraph {
            entities,
            relations,
        }
    }

    /// Total number of observations across all entities.
    pub fn observation_count(&self) -> usize {
        self.entities.iter().map(|e| e.observations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}
