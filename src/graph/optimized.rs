//! Read-cached, batch-capable front of the [`GraphManager`].
//!
//! The cache holds the last full graph as an `Arc<KnowledgeGraph>`. Reads
//! clone the pointer under a short read lock and then work on their own
//! copy. Writes run one at a time under `write_lock`, and the cache is
//! refreshed from the backend before the write call returns. Waiting for
//! `write_lock` is bounded by the backend's busy timeout.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::MemoryConfig;
use crate::error::{GraphResult, KgResult};
use crate::store::durable::lock_bounded;

use super::batch::{BatchOutcome, GraphBatch};
use super::manager::GraphManager;
use super::validate;
use super::{
    Entity, KnowledgeGraph, ObservationAddition, ObservationDeletion, ObservationResult, Relation,
};

pub struct OptimizedGraphManager {
    inner: GraphManager,
    cache: RwLock<Option<Arc<KnowledgeGraph>>>,
    write_lock: Mutex<()>,
    cache_enabled: bool,
}

impl OptimizedGraphManager {
    pub fn new(inner: GraphManager) -> Self {
        Self {
            inner,
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
            cache_enabled: true,
        }
    }

    /// With the cache disabled every read goes to a backend snapshot.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn open(config: &MemoryConfig) -> KgResult<Self> {
        let inner = GraphManager::open(config)?;
        Ok(Self::new(inner).with_cache(config.cache_enabled))
    }

    /// The graph as committed in the backend, bypassing the cache.
    pub fn backend_graph(&self) -> GraphResult<KnowledgeGraph> {
        self.inner.read_graph()
    }

    /// Whether the next read will be served without touching the backend.
    pub fn is_cache_warm(&self) -> bool {
        self.cache_enabled && self.cache.read().expect("cache lock poisoned").is_some()
    }

    // -- writes --------------------------------------------------------------

    pub fn create_entities(&self, entities: &[Entity]) -> GraphResult<Vec<Entity>> {
        self.write(|mgr| mgr.create_entities(entities))
    }

    pub fn create_relations(&self, relations: &[Relation]) -> GraphResult<Vec<Relation>> {
        self.write(|mgr| mgr.create_relations(relations))
    }

    pub fn add_observations(&self, entity_name: &str, contents: &[String]) -> GraphResult<Vec<String>> {
        self.write(|mgr| mgr.add_observations(entity_name, contents))
    }

    pub fn add_observations_many(
        &self,
        additions: &[ObservationAddition],
    ) -> GraphResult<Vec<ObservationResult>> {
        self.write(|mgr| mgr.add_observations_many(additions))
    }

    pub fn delete_entities<S: AsRef<str>>(&self, names: &[S]) -> GraphResult<usize> {
        self.write(|mgr| mgr.delete_entities(names))
    }

    pub fn delete_observations(&self, entity_name: &str, observations: &[String]) -> GraphResult<usize> {
        self.write(|mgr| mgr.delete_observations(entity_name, observations))
    }

    pub fn delete_observations_many(&self, deletions: &[ObservationDeletion]) -> GraphResult<usize> {
        self.write(|mgr| mgr.delete_observations_many(deletions))
    }

    pub fn delete_relations(&self, relations: &[Relation]) -> GraphResult<usize> {
        self.write(|mgr| mgr.delete_relations(relations))
    }

    /// Apply every section of `batch` in one transaction.
    ///
    /// On failure nothing is applied and the cache is left as it was.
    pub fn apply_batch(&self, batch: &GraphBatch) -> GraphResult<BatchOutcome> {
        self.write(|mgr| mgr.apply_batch(batch))
    }

    // -- reads ---------------------------------------------------------------

    pub fn read_graph(&self) -> GraphResult<KnowledgeGraph> {
        Ok(self.current()?.as_ref().clone())
    }

    pub fn search_nodes(&self, query: &str) -> GraphResult<KnowledgeGraph> {
        validate::validate_query(query)?;
        if !self.cache_enabled {
            return self.inner.search_nodes(query);
        }
        Ok(self.current()?.search(query))
    }

    pub fn open_nodes<S: AsRef<str>>(&self, names: &[S]) -> GraphResult<KnowledgeGraph> {
        validate::validate_names(names)?;
        if !self.cache_enabled {
            return self.inner.open_nodes(names);
        }
        Ok(self.current()?.open(names))
    }

    // -- internals -----------------------------------------------------------

    fn write<T>(&self, op: impl FnOnce(&GraphManager) -> GraphResult<T>) -> GraphResult<T> {
        let _guard = self.lock_writes()?;
        let value = op(&self.inner)?;
        self.refresh();
        Ok(value)
    }

    fn lock_writes(&self) -> GraphResult<MutexGuard<'_, ()>> {
        let timeout = self.inner.backend().busy_timeout();
        Ok(lock_bounded(&self.write_lock, timeout, "graph writes")?)
    }

    /// Hold the write section, as a long-running write would.
    #[cfg(test)]
    pub(crate) fn hold_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().expect("write lock poisoned")
    }

    /// Reload the cache after a committed write. Called with `write_lock` held.
    fn refresh(&self) {
        if !self.cache_enabled {
            return;
        }
        let fresh = match self.inner.read_graph() {
            Ok(graph) => Some(Arc::new(graph)),
            Err(err) => {
                tracing::warn!(error = %err, "cache refresh failed, invalidating");
                None
            }
        };
        *self.cache.write().expect("cache lock poisoned") = fresh;
    }

    /// The cached graph, loading it if the cache is cold.
    fn current(&self) -> GraphResult<Arc<KnowledgeGraph>> {
        if !self.cache_enabled {
            return Ok(Arc::new(self.inner.read_graph()?));
        }
        let cached = self.cache.read().expect("cache lock poisoned").clone();
        if let Some(graph) = cached {
            return Ok(graph);
        }

        // Load under the write lock so a concurrent write cannot publish a
        // newer graph that this load would then overwrite.
        let _guard = self.lock_writes()?;
        let cached = self.cache.read().expect("cache lock poisoned").clone();
        if let Some(graph) = cached {
            return Ok(graph);
        }
        let graph = Arc::new(self.inner.read_graph()?);
        *self.cache.write().expect("cache lock poisoned") = Some(Arc::clone(&graph));
        tracing::debug!(
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            "loaded graph cache"
        );
        Ok(graph)
    }
}

impl std::fmt::Debug for OptimizedGraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizedGraphManager")
            .field("inner", &self.inner)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_warm", &self.is_cache_warm())
            .finish()
    }
}
