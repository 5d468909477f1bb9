//! Grouped mutations applied in a single transaction.

use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::store::Transaction;

use super::manager::{
    stage_entities, stage_observation_deletions, stage_observations, stage_relations,
};
use super::{
    Entity, MissingEndpointPolicy, ObservationAddition, ObservationDeletion, ObservationResult,
    Relation,
};

/// Entity, relation and observation changes to apply together.
///
/// Sections are applied in a fixed order: entities, relations, observation
/// additions, then observation deletions. So a batch may create an entity and
/// relate it or observe it in the same call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphBatch {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub observations: Vec<ObservationAddition>,
    #[serde(default)]
    pub deletions: Vec<ObservationDeletion>,
}

impl GraphBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relate(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn observe(mut self, addition: ObservationAddition) -> Self {
        self.observations.push(addition);
        self
    }

    pub fn forget(mut self, deletion: ObservationDeletion) -> Self {
        self.deletions.push(deletion);
        self
    }

    /// Number of queued items across all sections.
    pub fn len(&self) -> usize {
        self.entities.len() + self.relations.len() + self.observations.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn stage(
        &self,
        txn: &mut Transaction<'_>,
        policy: MissingEndpointPolicy,
    ) -> GraphResult<BatchOutcome> {
        Ok(BatchOutcome {
            entities: stage_entities(txn, &self.entities)?,
            relations: stage_relations(txn, &self.relations, policy)?,
            observations: stage_observations(txn, &self.observations)?,
            deleted_observations: stage_observation_deletions(txn, &self.deletions)?,
        })
    }
}

/// What a committed batch actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub observations: Vec<ObservationResult>,
    pub deleted_observations: usize,
}
