//! The basic graph manager: every call runs in its own backend transaction.

use std::collections::{BTreeSet, HashSet};

use crate::config::{DatabaseLocation, MemoryConfig};
use crate::error::{GraphError, GraphResult, KgResult};
use crate::store::{Backend, GraphReader, Statement, Transaction};

use super::batch::{BatchOutcome, GraphBatch};
use super::validate;
use super::{
    Entity, KnowledgeGraph, MissingEndpointPolicy, ObservationAddition, ObservationDeletion,
    ObservationResult, Relation,
};

/// Maintains the graph invariants on top of a [`Backend`].
///
/// Inputs are validated before the backend is touched. A failing call rolls
/// back its transaction and leaves the graph unchanged.
pub struct GraphManager {
    backend: Backend,
    policy: MissingEndpointPolicy,
}

impl GraphManager {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            policy: MissingEndpointPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MissingEndpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Open the backend named by `config` and apply its policy.
    pub fn open(config: &MemoryConfig) -> KgResult<Self> {
        let backend = match DatabaseLocation::parse(&config.database_url)? {
            DatabaseLocation::File(path) => Backend::open(&path, config.busy_timeout()),
            DatabaseLocation::Memory => Backend::in_memory()
                .map(|backend| backend.with_busy_timeout(config.busy_timeout())),
        }
        .map_err(GraphError::from)?;
        Ok(Self::new(backend).with_policy(config.missing_endpoint))
    }

    pub fn policy(&self) -> MissingEndpointPolicy {
        self.policy
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Run `stage` inside one transaction: commit on success, roll back on error.
    pub(crate) fn write<T>(
        &self,
        op: &'static str,
        stage: impl FnOnce(&mut Transaction<'_>) -> GraphResult<T>,
    ) -> GraphResult<T> {
        let mut txn = self.backend.begin_transaction()?;
        match stage(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback() {
                    tracing::warn!(op, error = %rollback, "rollback failed");
                }
                tracing::debug!(op, error = %err, "write rolled back");
                Err(err)
            }
        }
    }

    /// Create entities whose names are not taken; returns only those created.
    pub fn create_entities(&self, entities: &[Entity]) -> GraphResult<Vec<Entity>> {
        entities.iter().try_for_each(validate::validate_entity)?;
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let created = self.write("create_entities", |txn| stage_entities(txn, entities))?;
        tracing::debug!(
            requested = entities.len(),
            created = created.len(),
            "created entities"
        );
        Ok(created)
    }

    /// Create relations, skipping existing triples; missing endpoints follow
    /// the manager's [`MissingEndpointPolicy`].
    pub fn create_relations(&self, relations: &[Relation]) -> GraphResult<Vec<Relation>> {
        relations.iter().try_for_each(validate::validate_relation)?;
        if relations.is_empty() {
            return Ok(Vec::new());
        }
        let policy = self.policy;
        let created = self.write("create_relations", |txn| {
            stage_relations(txn, relations, policy)
        })?;
        tracing::debug!(
            requested = relations.len(),
            created = created.len(),
            "created relations"
        );
        Ok(created)
    }

    /// Append observations to one entity, returning those actually added.
    pub fn add_observations(&self, entity_name: &str, contents: &[String]) -> GraphResult<Vec<String>> {
        let addition = ObservationAddition {
            entity_name: entity_name.to_string(),
            contents: contents.to_vec(),
        };
        let mut results = self.add_observations_many(std::slice::from_ref(&addition))?;
        Ok(results
            .pop()
            .map(|result| result.added_observations)
            .unwrap_or_default())
    }

    /// Append observations to several entities in one transaction.
    ///
    /// Fails with [`GraphError::EntityNotFound`] if any target is missing.
    pub fn add_observations_many(
        &self,
        additions: &[ObservationAddition],
    ) -> GraphResult<Vec<ObservationResult>> {
        additions.iter().try_for_each(validate::validate_addition)?;
        if additions.is_empty() {
            return Ok(Vec::new());
        }
        let results = self.write("add_observations", |txn| stage_observations(txn, additions))?;
        tracing::debug!(
            entities = results.len(),
            added = results.iter().map(|r| r.added_observations.len()).sum::<usize>(),
            "added observations"
        );
        Ok(results)
    }

    /// Delete entities with their observations and every relation touching
    /// them. Unknown names are ignored. Returns the number deleted.
    pub fn delete_entities<S: AsRef<str>>(&self, names: &[S]) -> GraphResult<usize> {
        validate::validate_names(names)?;
        if names.is_empty() {
            return Ok(0);
        }
        let deleted = self.write("delete_entities", |txn| {
            let statements: Vec<Statement<'_>> = names
                .iter()
                .map(|name| Statement::DeleteEntity {
                    name: name.as_ref(),
                })
                .collect();
            Ok(txn.execute_many(&statements)?)
        })?;
        tracing::debug!(requested = names.len(), deleted, "deleted entities");
        Ok(deleted)
    }

    /// Remove the given observation strings from one entity. Strings it does
    /// not carry and unknown entities are no-ops.
    pub fn delete_observations(&self, entity_name: &str, observations: &[String]) -> GraphResult<usize> {
        let deletion = ObservationDeletion {
            entity_name: entity_name.to_string(),
            observations: observations.to_vec(),
        };
        self.delete_observations_many(std::slice::from_ref(&deletion))
    }

    pub fn delete_observations_many(&self, deletions: &[ObservationDeletion]) -> GraphResult<usize> {
        deletions.iter().try_for_each(validate::validate_deletion)?;
        if deletions.is_empty() {
            return Ok(0);
        }
        let deleted = self.write("delete_observations", |txn| {
            stage_observation_deletions(txn, deletions)
        })?;
        tracing::debug!(deleted, "deleted observations");
        Ok(deleted)
    }

    /// Remove exact relation triples. Returns the number removed.
    pub fn delete_relations(&self, relations: &[Relation]) -> GraphResult<usize> {
        relations.iter().try_for_each(validate::validate_relation)?;
        if relations.is_empty() {
            return Ok(0);
        }
        let deleted = self.write("delete_relations", |txn| {
            let statements: Vec<Statement<'_>> =
                relations.iter().map(Statement::DeleteRelation).collect();
            Ok(txn.execute_many(&statements)?)
        })?;
        tracing::debug!(requested = relations.len(), deleted, "deleted relations");
        Ok(deleted)
    }

    /// Apply a whole batch in one transaction.
    pub fn apply_batch(&self, batch: &GraphBatch) -> GraphResult<BatchOutcome> {
        validate::validate_batch(batch)?;
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let policy = self.policy;
        let outcome = self.write("apply_batch", |txn| batch.stage(txn, policy))?;
        tracing::debug!(
            entities = outcome.entities.len(),
            relations = outcome.relations.len(),
            observations = outcome.observations.len(),
            deleted_observations = outcome.deleted_observations,
            "applied batch"
        );
        Ok(outcome)
    }

    pub fn read_graph(&self) -> GraphResult<KnowledgeGraph> {
        Ok(self.backend.snapshot()?.read_graph()?)
    }

    /// Case-insensitive substring search over names, types and observations.
    pub fn search_nodes(&self, query: &str) -> GraphResult<KnowledgeGraph> {
        validate::validate_query(query)?;
        Ok(self.read_graph()?.search(query))
    }

    /// The named entities plus the relations among them.
    pub fn open_nodes<S: AsRef<str>>(&self, names: &[S]) -> GraphResult<KnowledgeGraph> {
        validate::validate_names(names)?;
        let wanted: BTreeSet<&str> = names.iter().map(AsRef::as_ref).collect();
        Ok(self.backend.snapshot()?.read_subgraph(&wanted)?)
    }
}

impl std::fmt::Debug for GraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphManager")
            .field("backend", &self.backend)
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Staging: shared by single-item calls and batches
// ---------------------------------------------------------------------------

pub(crate) fn stage_entities(txn: &mut Transaction<'_>, entities: &[Entity]) -> GraphResult<Vec<Entity>> {
    let mut created = Vec::new();
    for entity in entities {
        // Also covers a name repeated within the same input.
        if txn.entity_exists(&entity.name)? {
            continue;
        }
        txn.execute(&Statement::InsertEntity {
            name: &entity.name,
            entity_type: &entity.entity_type,
        })?;

        let mut seen = HashSet::new();
        let mut observations = Vec::new();
        for text in &entity.observations {
            if !seen.insert(text.as_str()) {
                continue;
            }
            txn.execute(&Statement::InsertObservation {
                entity: &entity.name,
                text,
            })?;
            observations.push(text.clone());
        }

        created.push(Entity {
            name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            observations,
        });
    }
    Ok(created)
}

pub(crate) fn stage_relations(
    txn: &mut Transaction<'_>,
    relations: &[Relation],
    policy: MissingEndpointPolicy,
) -> GraphResult<Vec<Relation>> {
    let mut created = Vec::new();
    'relations: for relation in relations {
        for endpoint in [&relation.from, &relation.to] {
            if txn.entity_exists(endpoint)? {
                continue;
            }
            match policy {
                MissingEndpointPolicy::Skip => {
                    tracing::debug!(%relation, missing = %endpoint, "skipping relation");
                    continue 'relations;
                }
                MissingEndpointPolicy::Reject => {
                    return Err(GraphError::EntityNotFound {
                        name: endpoint.clone(),
                    });
                }
            }
        }
        if txn.relation_exists(relation)? {
            continue;
        }
        txn.execute(&Statement::InsertRelation(relation))?;
        created.push(relation.clone());
    }
    Ok(created)
}

pub(crate) fn stage_observations(
    txn: &mut Transaction<'_>,
    additions: &[ObservationAddition],
) -> GraphResult<Vec<ObservationResult>> {
    let mut results = Vec::with_capacity(additions.len());
    for addition in additions {
        let Some(entity) = txn.entity(&addition.entity_name)? else {
            return Err(GraphError::EntityNotFound {
                name: addition.entity_name.clone(),
            });
        };
        let mut present: HashSet<String> = entity.observations.into_iter().collect();
        let mut added = Vec::new();
        for text in &addition.contents {
            if !present.insert(text.clone()) {
                continue;
            }
            txn.execute(&Statement::InsertObservation {
                entity: &addition.entity_name,
                text,
            })?;
            added.push(text.clone());
        }
        results.push(ObservationResult {
            entity_name: addition.entity_name.clone(),
            added_observations: added,
        });
    }
    Ok(results)
}

pub(crate) fn stage_observation_deletions(
    txn: &mut Transaction<'_>,
    deletions: &[ObservationDeletion],
) -> GraphResult<usize> {
    let statements: Vec<Statement<'_>> = deletions
        .iter()
        .flat_map(|deletion| {
            deletion
                .observations
                .iter()
                .map(|text| Statement::DeleteObservation {
                    entity: &deletion.entity_name,
                    text,
                })
        })
        .collect();
    Ok(txn.execute_many(&statements)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> GraphManager {
        GraphManager::new(Backend::in_memory().unwrap())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn alice_and_bob(mgr: &GraphManager) {
        mgr.create_entities(&[
            Entity::new("Alice", "Person").with_observations(["likes tea"]),
            Entity::new("Bob", "Person"),
        ])
        .unwrap();
        mgr.create_relations(&[Relation::new("Alice", "Bob", "knows")])
            .unwrap();
    }

    #[test]
    fn existing_names_are_skipped_not_overwritten() {
        let mgr = manager();
        alice_and_bob(&mgr);
        let created = mgr
            .create_entities(&[
                Entity::new("Alice", "Robot"),
                Entity::new("Carol", "Person"),
                Entity::new("Carol", "Cat"),
            ])
            .unwrap();
        assert_eq!(created, vec![Entity::new("Carol", "Person")]);

        let graph = mgr.read_graph().unwrap();
        let alice = graph.entity("Alice").unwrap();
        assert_eq!(alice.entity_type, "Person");
        assert_eq!(alice.observations, ["likes tea"]);
    }

    #[test]
    fn duplicate_input_observations_are_collapsed() {
        let mgr = manager();
        let created = mgr
            .create_entities(&[Entity::new("Eve", "Person").with_observations(["a", "b", "a"])])
            .unwrap();
        assert_eq!(created[0].observations, ["a", "b"]);
    }

    #[test]
    fn missing_endpoint_is_skipped_by_default() {
        let mgr = manager();
        alice_and_bob(&mgr);
        let created = mgr
            .create_relations(&[
                Relation::new("Alice", "Nobody", "knows"),
                Relation::new("Bob", "Alice", "knows"),
                Relation::new("Alice", "Bob", "knows"),
            ])
            .unwrap();
        assert_eq!(created, vec![Relation::new("Bob", "Alice", "knows")]);
    }

    #[test]
    fn reject_policy_fails_the_whole_call() {
        let mgr = manager().with_policy(MissingEndpointPolicy::Reject);
        alice_and_bob(&mgr);
        let err = mgr
            .create_relations(&[
                Relation::new("Bob", "Alice", "knows"),
                Relation::new("Alice", "Nobody", "knows"),
            ])
            .unwrap_err();
        assert!(matches!(err, GraphError::EntityNotFound { ref name } if name == "Nobody"));
        assert_eq!(mgr.read_graph().unwrap().relations.len(), 1);
    }

    #[test]
    fn add_observations_skips_present_and_requires_entity() {
        let mgr = manager();
        alice_and_bob(&mgr);
        let added = mgr
            .add_observations("Alice", &strings(&["likes tea", "plays chess", "plays chess"]))
            .unwrap();
        assert_eq!(added, ["plays chess"]);

        let err = mgr
            .add_observations("Nobody", &strings(&["ghost"]))
            .unwrap_err();
        assert!(matches!(err, GraphError::EntityNotFound { .. }));
    }

    #[test]
    fn add_observations_many_is_atomic() {
        let mgr = manager();
        alice_and_bob(&mgr);
        let result = mgr.add_observations_many(&[
            ObservationAddition::new("Bob", ["new fact"]),
            ObservationAddition::new("Nobody", ["ghost"]),
        ]);
        assert!(result.is_err());
        assert!(mgr.read_graph().unwrap().entity("Bob").unwrap().observations.is_empty());
    }

    #[test]
    fn delete_observations_ignores_unknowns() {
        let mgr = manager();
        alice_and_bob(&mgr);
        assert_eq!(
            mgr.delete_observations("Alice", &strings(&["likes tea", "never said"]))
                .unwrap(),
            1
        );
        assert_eq!(mgr.delete_observations("Nobody", &strings(&["x"])).unwrap(), 0);
        assert_eq!(mgr.read_graph().unwrap().observation_count(), 0);
    }

    #[test]
    fn delete_entity_cascades() {
        let mgr = manager();
        alice_and_bob(&mgr);
        assert_eq!(mgr.delete_entities(&["Bob", "Nobody"]).unwrap(), 1);
        let graph = mgr.read_graph().unwrap();
        assert_eq!(graph.entities.len(), 1);
        assert!(graph.relations.is_empty());
    }

    #[test]
    fn delete_relations_removes_exact_triples() {
        let mgr = manager();
        alice_and_bob(&mgr);
        let removed = mgr
            .delete_relations(&[
                Relation::new("Alice", "Bob", "likes"),
                Relation::new("Alice", "Bob", "knows"),
            ])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(mgr.read_graph().unwrap().relations.is_empty());
    }

    #[test]
    fn search_rejects_blank_query_before_reading() {
        let mgr = manager();
        let err = mgr.search_nodes("   ").unwrap_err();
        assert!(matches!(err, GraphError::Validation { .. }));
    }

    #[test]
    fn open_nodes_returns_relations_among_named() {
        let mgr = manager();
        alice_and_bob(&mgr);
        mgr.create_entities(&[Entity::new("Carol", "Person")]).unwrap();
        mgr.create_relations(&[Relation::new("Bob", "Carol", "knows")])
            .unwrap();

        let graph = mgr.open_nodes(&["Alice", "Bob", "Zed"]).unwrap();
        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.relations, vec![Relation::new("Alice", "Bob", "knows")]);
    }

    #[test]
    fn validation_runs_before_backend() {
        let mgr = manager();
        let err = mgr.create_entities(&[Entity::new("", "Person")]).unwrap_err();
        assert!(matches!(err, GraphError::Validation { .. }));
        assert!(mgr.read_graph().unwrap().is_empty());
    }
}
