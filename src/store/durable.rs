//! ACID-durable graph tables backed by redb.
//!
//! redb allows a single write transaction at a time and blocks
//! `begin_write` while another is open. [`Backend`] puts a writer slot in
//! front of it that is acquired with a bounded wait, so a stuck writer turns
//! into [`StoreError::Busy`] instead of a hang. Readers use MVCC snapshots
//! and never wait.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use redb::backends::InMemoryBackend;
use redb::{
    Database, DatabaseError, ReadTransaction, ReadableTable, StorageError, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{Constraint, StoreError};
use crate::graph::{Entity, KnowledgeGraph, Relation};

use super::{GraphReader, Statement, StoreResult};

/// Entity name → bincode-encoded [`EntityRow`].
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");

/// (entity name, sequence) → observation text.
const OBSERVATIONS: TableDefinition<(&str, u64), &str> = TableDefinition::new("observations");

/// (from, to, relation type) → ().
const RELATIONS: TableDefinition<(&str, &str, &str), ()> = TableDefinition::new("relations");

/// (to, from, relation type) → (). Mirrors `relations` for incoming lookups.
const RELATIONS_BY_TARGET: TableDefinition<(&str, &str, &str), ()> =
    TableDefinition::new("relations_by_target");

/// How often a blocked open or writer retries.
const BUSY_POLL: Duration = Duration::from_millis(5);

/// Default bound on waiting for the writer slot or the database file lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Stored per entity. Observations live in their own table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityRow {
    entity_type: String,
    /// Sequence number for the next appended observation. Never reused.
    next_observation: u64,
}

impl EntityRow {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization {
            message: format!("failed to encode entity row: {e}"),
        })
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
            message: format!("failed to decode entity row: {e}"),
        })
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(source) => StoreError::Io { source },
            other => StoreError::Redb {
                message: other.to_string(),
            },
        }
    }
}

fn redb_failure<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The redb database holding the graph tables.
pub struct Backend {
    db: Database,
    location: String,
    writer: Mutex<()>,
    busy_timeout: Duration,
}

impl Backend {
    /// Open or create a database file, creating the tables if absent.
    ///
    /// If another process holds the file, retries until `busy_timeout`
    /// elapses and then fails with [`StoreError::Busy`].
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
        }

        let started = Instant::now();
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if started.elapsed() >= busy_timeout {
                        return Err(StoreError::Busy {
                            waited_ms: elapsed_ms(started),
                        });
                    }
                    tracing::debug!(path = %path.display(), "database file locked, waiting");
                    std::thread::sleep(BUSY_POLL);
                }
                Err(DatabaseError::Storage(StorageError::Io(source))) => {
                    return Err(StoreError::Io { source });
                }
                Err(e) => {
                    return Err(StoreError::Redb {
                        message: format!("failed to open redb at {}: {e}", path.display()),
                    });
                }
            }
        };

        let backend = Self::init(db, path.display().to_string(), busy_timeout)?;
        tracing::info!(path = %path.display(), "opened knowledge graph database");
        Ok(backend)
    }

    /// A non-persistent database, for tests and scratch sessions.
    pub fn in_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(redb_failure("create in-memory database"))?;
        Self::init(db, ":memory:".into(), DEFAULT_BUSY_TIMEOUT)
    }

    fn init(db: Database, location: String, busy_timeout: Duration) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(redb_failure("begin_write"))?;
        {
            let _ = txn
                .open_table(ENTITIES)
                .map_err(redb_failure("create entities table"))?;
            let _ = txn
                .open_table(OBSERVATIONS)
                .map_err(redb_failure("create observations table"))?;
            let _ = txn
                .open_table(RELATIONS)
                .map_err(redb_failure("create relations table"))?;
            let _ = txn
                .open_table(RELATIONS_BY_TARGET)
                .map_err(redb_failure("create relations_by_target table"))?;
        }
        txn.commit().map_err(redb_failure("commit"))?;

        Ok(Self {
            db,
            location,
            writer: Mutex::new(()),
            busy_timeout,
        })
    }

    /// Override the bounded wait for the writer slot.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Where the database lives (file path or `:memory:`).
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Start a write transaction.
    ///
    /// Dropping the returned transaction without committing rolls it back.
    pub fn begin_transaction(&self) -> StoreResult<Transaction<'_>> {
        let writer = self.acquire_writer()?;
        let txn = self.db.begin_write().map_err(redb_failure("begin_write"))?;
        Ok(Transaction {
            txn,
            _writer: writer,
        })
    }

    /// A consistent read-only view of the last committed state.
    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        let txn = self.db.begin_read().map_err(redb_failure("begin_read"))?;
        Ok(Snapshot { txn })
    }

    /// The bound on waiting for the writer slot.
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    fn acquire_writer(&self) -> StoreResult<MutexGuard<'_, ()>> {
        lock_bounded(&self.writer, self.busy_timeout, &self.location)
    }
}

/// Lock `slot`, polling until `timeout` elapses, then fail with
/// [`StoreError::Busy`]. `slot` must guard no data: a poisoned lock is
/// taken over as is.
pub(crate) fn lock_bounded<'a>(
    slot: &'a Mutex<()>,
    timeout: Duration,
    what: &str,
) -> StoreResult<MutexGuard<'a, ()>> {
    let started = Instant::now();
    loop {
        match slot.try_lock() {
            Ok(guard) => return Ok(guard),
            // A panicked writer's redb transaction was already aborted on unwind.
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if started.elapsed() >= timeout {
                    tracing::warn!(slot = what, waited_ms = elapsed_ms(started), "writer slot busy");
                    return Err(StoreError::Busy {
                        waited_ms: elapsed_ms(started),
                    });
                }
                std::thread::sleep(BUSY_POLL);
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("location", &self.location)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

/// A read-only MVCC snapshot.
pub struct Snapshot {
    txn: ReadTransaction,
}

/// An open write transaction holding the backend's writer slot.
///
/// Either [`commit`](Self::commit) applies every executed statement or none
/// of them apply.
pub struct Transaction<'a> {
    // Declared before the slot so the redb transaction is released first.
    txn: WriteTransaction,
    _writer: MutexGuard<'a, ()>,
}

impl Transaction<'_> {
    /// Execute one statement, returning the number of rows it affected.
    pub fn execute(&mut self, statement: &Statement<'_>) -> StoreResult<usize> {
        match *statement {
            Statement::InsertEntity { name, entity_type } => self.insert_entity(name, entity_type),
            Statement::DeleteEntity { name } => self.delete_entity(name),
            Statement::InsertObservation { entity, text } => self.insert_observation(entity, text),
            Statement::DeleteObservation { entity, text } => self.delete_observation(entity, text),
            Statement::InsertRelation(relation) => self.insert_relation(relation),
            Statement::DeleteRelation(relation) => self.delete_relation(relation),
        }
    }

    /// Execute statements in order, stopping at the first failure.
    pub fn execute_many(&mut self, statements: &[Statement<'_>]) -> StoreResult<usize> {
        statements
            .iter()
            .try_fold(0, |total, statement| Ok(total + self.execute(statement)?))
    }

    pub fn commit(self) -> StoreResult<()> {
        let Transaction { txn, _writer } = self;
        txn.commit().map_err(redb_failure("commit"))
    }

    pub fn rollback(self) -> StoreResult<()> {
        self.txn.abort().map_err(StoreError::from)
    }

    fn insert_entity(&mut self, name: &str, entity_type: &str) -> StoreResult<usize> {
        let mut entities = self
            .txn
            .open_table(ENTITIES)
            .map_err(redb_failure("open entities"))?;
        if entities.get(name)?.is_some() {
            return Err(StoreError::ConstraintViolation {
                constraint: Constraint::UniqueEntity,
                message: format!("entity \"{name}\" already exists"),
            });
        }
        let row = EntityRow {
            entity_type: entity_type.to_string(),
            next_observation: 0,
        }
        .encode()?;
        entities.insert(name, row.as_slice())?;
        Ok(1)
    }

    fn delete_entity(&mut self, name: &str) -> StoreResult<usize> {
        let removed = {
            let mut entities = self
                .txn
                .open_table(ENTITIES)
                .map_err(redb_failure("open entities"))?;
            let removed = entities.remove(name)?.is_some();
            removed
        };
        if !removed {
            return Ok(0);
        }

        {
            let mut observations = self
                .txn
                .open_table(OBSERVATIONS)
                .map_err(redb_failure("open observations"))?;
            for (seq, _) in observation_entries(&observations, name)? {
                observations.remove((name, seq))?;
            }
        }

        let mut relations = self
            .txn
            .open_table(RELATIONS)
            .map_err(redb_failure("open relations"))?;
        let mut by_target = self
            .txn
            .open_table(RELATIONS_BY_TARGET)
            .map_err(redb_failure("open relations_by_target"))?;

        let outgoing = triples_with_prefix(&relations, name)?;
        let incoming = triples_with_prefix(&by_target, name)?;
        for (from, to, kind) in &outgoing {
            relations.remove((from.as_str(), to.as_str(), kind.as_str()))?;
            by_target.remove((to.as_str(), from.as_str(), kind.as_str()))?;
        }
        for (to, from, kind) in &incoming {
            relations.remove((from.as_str(), to.as_str(), kind.as_str()))?;
            by_target.remove((to.as_str(), from.as_str(), kind.as_str()))?;
        }

        tracing::trace!(
            entity = name,
            relations = outgoing.len() + incoming.len(),
            "cascaded entity delete"
        );
        Ok(1)
    }

    fn insert_observation(&mut self, entity: &str, text: &str) -> StoreResult<usize> {
        let mut entities = self
            .txn
            .open_table(ENTITIES)
            .map_err(redb_failure("open entities"))?;
        let Some(mut row) = read_row(&entities, entity)? else {
            return Err(StoreError::ConstraintViolation {
                constraint: Constraint::ForeignKey,
                message: format!("observation targets missing entity \"{entity}\""),
            });
        };

        let mut observations = self
            .txn
            .open_table(OBSERVATIONS)
            .map_err(redb_failure("open observations"))?;
        if observation_entries(&observations, entity)?
            .iter()
            .any(|(_, existing)| existing == text)
        {
            return Err(StoreError::ConstraintViolation {
                constraint: Constraint::UniqueObservation,
                message: format!("entity \"{entity}\" already has observation \"{text}\""),
            });
        }

        observations.insert((entity, row.next_observation), text)?;
        row.next_observation += 1;
        entities.insert(entity, row.encode()?.as_slice())?;
        Ok(1)
    }

    fn delete_observation(&mut self, entity: &str, text: &str) -> StoreResult<usize> {
        let mut observations = self
            .txn
            .open_table(OBSERVATIONS)
            .map_err(redb_failure("open observations"))?;
        let matching: Vec<u64> = observation_entries(&observations, entity)?
            .into_iter()
            .filter(|(_, existing)| existing == text)
            .map(|(seq, _)| seq)
            .collect();
        for seq in &matching {
            observations.remove((entity, *seq))?;
        }
        Ok(matching.len())
    }

    fn insert_relation(&mut self, relation: &Relation) -> StoreResult<usize> {
        {
            let entities = self
                .txn
                .open_table(ENTITIES)
                .map_err(redb_failure("open entities"))?;
            for endpoint in [&relation.from, &relation.to] {
                if entities.get(endpoint.as_str())?.is_none() {
                    return Err(StoreError::ConstraintViolation {
                        constraint: Constraint::ForeignKey,
                        message: format!("relation {relation} references missing entity \"{endpoint}\""),
                    });
                }
            }
        }

        let key = (
            relation.from.as_str(),
            relation.to.as_str(),
            relation.relation_type.as_str(),
        );
        let mut relations = self
            .txn
            .open_table(RELATIONS)
            .map_err(redb_failure("open relations"))?;
        if relations.get(key)?.is_some() {
            return Err(StoreError::ConstraintViolation {
                constraint: Constraint::UniqueRelation,
                message: format!("relation {relation} already exists"),
            });
        }
        relations.insert(key, ())?;

        let mut by_target = self
            .txn
            .open_table(RELATIONS_BY_TARGET)
            .map_err(redb_failure("open relations_by_target"))?;
        by_target.insert((key.1, key.0, key.2), ())?;
        Ok(1)
    }

    fn delete_relation(&mut self, relation: &Relation) -> StoreResult<usize> {
        let key = (
            relation.from.as_str(),
            relation.to.as_str(),
            relation.relation_type.as_str(),
        );
        let mut relations = self
            .txn
            .open_table(RELATIONS)
            .map_err(redb_failure("open relations"))?;
        let existed = relations.remove(key)?.is_some();
        if !existed {
            return Ok(0);
        }
        let mut by_target = self
            .txn
            .open_table(RELATIONS_BY_TARGET)
            .map_err(redb_failure("open relations_by_target"))?;
        by_target.remove((key.1, key.0, key.2))?;
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Table readers shared by snapshots and write transactions
// ---------------------------------------------------------------------------

trait EntityTable: ReadableTable<&'static str, &'static [u8]> {}
impl<T: ReadableTable<&'static str, &'static [u8]>> EntityTable for T {}

trait ObservationTable: ReadableTable<(&'static str, u64), &'static str> {}
impl<T: ReadableTable<(&'static str, u64), &'static str>> ObservationTable for T {}

trait TripleTable: ReadableTable<(&'static str, &'static str, &'static str), ()> {}
impl<T: ReadableTable<(&'static str, &'static str, &'static str), ()>> TripleTable for T {}

fn read_row(entities: &impl EntityTable, name: &str) -> StoreResult<Option<EntityRow>> {
    match entities.get(name)? {
        Some(guard) => EntityRow::decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// `(sequence, text)` pairs for one entity, in insertion order.
fn observation_entries(
    observations: &impl ObservationTable,
    entity: &str,
) -> StoreResult<Vec<(u64, String)>> {
    let mut out = Vec::new();
    for entry in observations.range((entity, 0u64)..=(entity, u64::MAX))? {
        let (key, value) = entry?;
        out.push((key.value().1, value.value().to_string()));
    }
    Ok(out)
}

/// All keys whose first component is `first`, in key order.
fn triples_with_prefix(
    table: &impl TripleTable,
    first: &str,
) -> StoreResult<Vec<(String, String, String)>> {
    let mut out = Vec::new();
    for entry in table.range((first, "", "")..)? {
        let (key, _) = entry?;
        let (a, b, c) = key.value();
        if a != first {
            break;
        }
        out.push((a.to_string(), b.to_string(), c.to_string()));
    }
    Ok(out)
}

fn load_entity(
    entities: &impl EntityTable,
    observations: &impl ObservationTable,
    name: &str,
) -> StoreResult<Option<Entity>> {
    let Some(row) = read_row(entities, name)? else {
        return Ok(None);
    };
    let observations = observation_entries(observations, name)?
        .into_iter()
        .map(|(_, text)| text)
        .collect();
    Ok(Some(Entity {
        name: name.to_string(),
        entity_type: row.entity_type,
        observations,
    }))
}

fn load_graph(
    entities: &impl EntityTable,
    observations: &impl ObservationTable,
    relations: &impl TripleTable,
) -> StoreResult<KnowledgeGraph> {
    let mut observed: HashMap<String, Vec<String>> = HashMap::new();
    for entry in observations.iter()? {
        let (key, value) = entry?;
        observed
            .entry(key.value().0.to_string())
            .or_default()
            .push(value.value().to_string());
    }

    let mut graph = KnowledgeGraph::default();
    for entry in entities.iter()? {
        let (key, value) = entry?;
        let name = key.value().to_string();
        let row = EntityRow::decode(value.value())?;
        graph.entities.push(Entity {
            observations: observed.remove(&name).unwrap_or_default(),
            name,
            entity_type: row.entity_type,
        });
    }

    for entry in relations.iter()? {
        let (key, _) = entry?;
        let (from, to, kind) = key.value();
        graph.relations.push(Relation::new(from, to, kind));
    }
    Ok(graph)
}

fn load_subgraph(
    entities: &impl EntityTable,
    observations: &impl ObservationTable,
    relations: &impl TripleTable,
    names: &BTreeSet<&str>,
) -> StoreResult<KnowledgeGraph> {
    let mut graph = KnowledgeGraph::default();
    for name in names {
        if let Some(entity) = load_entity(entities, observations, name)? {
            graph.entities.push(entity);
        }
    }
    let found: BTreeSet<&str> = graph.entities.iter().map(|e| e.name.as_str()).collect();
    let mut among = Vec::new();
    for from in &found {
        for (from, to, kind) in triples_with_prefix(relations, from)? {
            if found.contains(to.as_str()) {
                among.push(Relation {
                    from,
                    to,
                    relation_type: kind,
                });
            }
        }
    }
    graph.relations = among;
    Ok(graph)
}

macro_rules! impl_graph_reader {
    ($ty:ty) => {
        impl GraphReader for $ty {
            fn entity_exists(&self, name: &str) -> StoreResult<bool> {
                let entities = self
                    .txn
                    .open_table(ENTITIES)
                    .map_err(redb_failure("open entities"))?;
                let exists = entities.get(name)?.is_some();
                Ok(exists)
            }

            fn entity(&self, name: &str) -> StoreResult<Option<Entity>> {
                let entities = self
                    .txn
                    .open_table(ENTITIES)
                    .map_err(redb_failure("open entities"))?;
                let observations = self
                    .txn
                    .open_table(OBSERVATIONS)
                    .map_err(redb_failure("open observations"))?;
                load_entity(&entities, &observations, name)
            }

            fn relation_exists(&self, relation: &Relation) -> StoreResult<bool> {
                let relations = self
                    .txn
                    .open_table(RELATIONS)
                    .map_err(redb_failure("open relations"))?;
                let key = (
                    relation.from.as_str(),
                    relation.to.as_str(),
                    relation.relation_type.as_str(),
                );
                let exists = relations.get(key)?.is_some();
                Ok(exists)
            }

            fn read_graph(&self) -> StoreResult<KnowledgeGraph> {
                let entities = self
                    .txn
                    .open_table(ENTITIES)
                    .map_err(redb_failure("open entities"))?;
                let observations = self
                    .txn
                    .open_table(OBSERVATIONS)
                    .map_err(redb_failure("open observations"))?;
                let relations = self
                    .txn
                    .open_table(RELATIONS)
                    .map_err(redb_failure("open relations"))?;
                load_graph(&entities, &observations, &relations)
            }

            fn read_subgraph(&self, names: &BTreeSet<&str>) -> StoreResult<KnowledgeGraph> {
                let entities = self
                    .txn
                    .open_table(ENTITIES)
                    .map_err(redb_failure("open entities"))?;
                let observations = self
                    .txn
                    .open_table(OBSERVATIONS)
                    .map_err(redb_failure("open observations"))?;
                let relations = self
                    .txn
                    .open_table(RELATIONS)
                    .map_err(redb_failure("open relations"))?;
                load_subgraph(&entities, &observations, &relations, names)
            }
        }
    };
}

impl_graph_reader!(Snapshot);
impl_graph_reader!(Transaction<'_>);
