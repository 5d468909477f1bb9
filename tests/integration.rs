//! End-to-end integration tests for the kg-memory graph managers.
//!
//! These tests run the optimized manager over file-backed databases and
//! check the graph invariants across single-item calls, batches, the read
//! cache and concurrent writers.

use std::sync::Arc;
use std::thread;

use kg_memory::config::MemoryConfig;
use kg_memory::error::GraphError;
use kg_memory::graph::{
    Entity, GraphBatch, GraphManager, MissingEndpointPolicy, ObservationAddition,
    ObservationDeletion, OptimizedGraphManager, Relation,
};
use kg_memory::store::Backend;
use kg_memory::tools;

fn persistent_manager(dir: &std::path::Path) -> OptimizedGraphManager {
    let config = MemoryConfig {
        database_url: format!("redb://{}", dir.join("graph.redb").display()),
        ..Default::default()
    };
    OptimizedGraphManager::open(&config).unwrap()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn alice_and_bob_scenario() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());

    let created = mgr
        .create_entities(&[Entity::new("Alice", "Person"), Entity::new("Bob", "Person")])
        .unwrap();
    assert_eq!(created.len(), 2);
    mgr.create_relations(&[Relation::new("Alice", "Bob", "knows")])
        .unwrap();

    let graph = mgr.read_graph().unwrap();
    assert_eq!(graph.entities.len(), 2);
    assert_eq!(graph.relations.len(), 1);

    mgr.delete_entities(&["Bob"]).unwrap();
    let graph = mgr.read_graph().unwrap();
    assert_eq!(graph.entities.len(), 1);
    assert!(graph.relations.is_empty());
}

#[test]
fn recreating_a_name_changes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    mgr.create_entities(&[Entity::new("Alice", "Person").with_observations(["likes tea"])])
        .unwrap();

    let created = mgr
        .create_entities(&[Entity::new("Alice", "Robot").with_observations(["beeps"])])
        .unwrap();
    assert!(created.is_empty());

    let graph = mgr.read_graph().unwrap();
    assert_eq!(
        graph.entities,
        vec![Entity::new("Alice", "Person").with_observations(["likes tea"])]
    );
}

#[test]
fn deleting_an_entity_removes_everything_it_touches() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    mgr.create_entities(&[
        Entity::new("Alice", "Person").with_observations(["one", "two"]),
        Entity::new("Bob", "Person"),
        Entity::new("Carol", "Person"),
    ])
    .unwrap();
    mgr.create_relations(&[
        Relation::new("Alice", "Bob", "knows"),
        Relation::new("Carol", "Alice", "knows"),
        Relation::new("Alice", "Alice", "is"),
        Relation::new("Bob", "Carol", "knows"),
    ])
    .unwrap();

    mgr.delete_entities(&["Alice"]).unwrap();
    let graph = mgr.read_graph().unwrap();
    assert_eq!(graph.relations, vec![Relation::new("Bob", "Carol", "knows")]);
    assert_eq!(graph.observation_count(), 0);
    assert!(mgr.search_nodes("one").unwrap().entities.is_empty());
}

#[test]
fn search_finds_observations_and_keeps_two_sided_relations() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    mgr.create_entities(&[
        Entity::new("Alice", "Person").with_observations(["contains foo text"]),
        Entity::new("Bob", "Person"),
        Entity::new("Foobar", "Project"),
    ])
    .unwrap();
    mgr.create_relations(&[
        Relation::new("Alice", "Bob", "knows"),
        Relation::new("Alice", "Foobar", "works_on"),
    ])
    .unwrap();

    for query in ["foo", "FOO", "Foo"] {
        let graph = mgr.search_nodes(query).unwrap();
        let names: Vec<&str> = graph.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Alice", "Foobar"], "query {query:?}");
        assert_eq!(
            graph.relations,
            vec![Relation::new("Alice", "Foobar", "works_on")]
        );
    }
}

#[test]
fn batch_matches_one_at_a_time_application() {
    let one_at_a_time = OptimizedGraphManager::new(GraphManager::new(Backend::in_memory().unwrap()));
    one_at_a_time
        .create_entities(&[
            Entity::new("Alice", "Person").with_observations(["likes tea"]),
            Entity::new("Bob", "Person"),
        ])
        .unwrap();
    one_at_a_time
        .create_relations(&[
            Relation::new("Alice", "Bob", "knows"),
            Relation::new("Bob", "Nobody", "knows"),
        ])
        .unwrap();
    one_at_a_time
        .add_observations("Bob", &strings(&["plays chess", "temp"]))
        .unwrap();
    one_at_a_time
        .delete_observations("Bob", &strings(&["temp"]))
        .unwrap();

    let batched = OptimizedGraphManager::new(GraphManager::new(Backend::in_memory().unwrap()));
    let outcome = batched
        .apply_batch(
            &GraphBatch::new()
                .entity(Entity::new("Alice", "Person").with_observations(["likes tea"]))
                .entity(Entity::new("Bob", "Person"))
                .relate(Relation::new("Alice", "Bob", "knows"))
                .relate(Relation::new("Bob", "Nobody", "knows"))
                .observe(ObservationAddition::new("Bob", ["plays chess", "temp"]))
                .forget(ObservationDeletion::new("Bob", ["temp"])),
        )
        .unwrap();
    assert_eq!(outcome.relations.len(), 1);
    assert_eq!(outcome.deleted_observations, 1);

    assert_eq!(
        batched.read_graph().unwrap(),
        one_at_a_time.read_graph().unwrap()
    );
}

#[test]
fn failed_batch_changes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    mgr.create_entities(&[Entity::new("Alice", "Person")]).unwrap();
    let before = mgr.read_graph().unwrap();

    // The observation targets an entity that exists nowhere.
    let batch = GraphBatch::new()
        .entity(Entity::new("Bob", "Person"))
        .relate(Relation::new("Alice", "Bob", "knows"))
        .observe(ObservationAddition::new("Ghost", ["boo"]));
    let err = mgr.apply_batch(&batch).unwrap_err();
    assert!(matches!(err, GraphError::EntityNotFound { ref name } if name == "Ghost"));

    assert_eq!(mgr.read_graph().unwrap(), before);
    assert_eq!(mgr.backend_graph().unwrap(), before);
}

#[test]
fn reject_policy_applies_to_batches_too() {
    let mgr = OptimizedGraphManager::new(
        GraphManager::new(Backend::in_memory().unwrap()).with_policy(MissingEndpointPolicy::Reject),
    );
    let batch = GraphBatch::new()
        .entity(Entity::new("Alice", "Person"))
        .relate(Relation::new("Alice", "Bob", "knows"));
    assert!(matches!(
        mgr.apply_batch(&batch),
        Err(GraphError::EntityNotFound { .. })
    ));
    assert!(mgr.read_graph().unwrap().is_empty());
}

#[test]
fn next_read_reflects_each_write() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    // Warm the cache before writing.
    assert!(mgr.read_graph().unwrap().is_empty());

    mgr.create_entities(&[Entity::new("Alice", "Person")]).unwrap();
    assert_eq!(mgr.open_nodes(&["Alice"]).unwrap().entities.len(), 1);

    mgr.add_observations("Alice", &strings(&["likes tea"]))
        .unwrap();
    assert_eq!(mgr.search_nodes("tea").unwrap().entities.len(), 1);

    mgr.delete_observations("Alice", &strings(&["likes tea"]))
        .unwrap();
    assert!(mgr.search_nodes("tea").unwrap().entities.is_empty());

    mgr.delete_entities(&["Alice"]).unwrap();
    assert!(mgr.read_graph().unwrap().is_empty());
}

#[test]
fn concurrent_writers_do_not_lose_updates() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = Arc::new(persistent_manager(dir.path()));
    mgr.create_entities(&[Entity::new("Hub", "Node")]).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                for i in 0..10 {
                    let name = format!("n{worker}-{i}");
                    mgr.create_entities(&[Entity::new(name.clone(), "Node")])
                        .unwrap();
                    mgr.create_relations(&[Relation::new(name, "Hub", "links")])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let graph = mgr.read_graph().unwrap();
    assert_eq!(graph.entities.len(), 41);
    assert_eq!(graph.relations.len(), 40);
    assert_eq!(graph, mgr.backend_graph().unwrap());
}

#[test]
fn tool_session_over_a_byte_stream() {
    let dir = tempfile::TempDir::new().unwrap();
    let mgr = persistent_manager(dir.path());
    let input = [
        r#"{"id":1,"name":"create_entities","arguments":{"entities":[{"name":"Alice","entityType":"Person"},{"name":"Bob","entityType":"Person"}]}}"#,
        r#"{"id":2,"name":"create_relations","arguments":{"relations":[{"from":"Alice","to":"Bob","relationType":"knows"}]}}"#,
        r#"{"id":3,"name":"delete_entities","arguments":{"entityNames":["Bob"]}}"#,
        r#"{"id":4,"name":"read_graph","arguments":{}}"#,
        r#"{"id":5,"name":"search_nodes","arguments":{"query":""}}"#,
    ]
    .join("\n");

    let mut out = Vec::new();
    assert_eq!(tools::serve(&mgr, input.as_bytes(), &mut out).unwrap(), 5);
    let responses: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(responses[1]["result"].as_array().unwrap().len(), 1);
    assert_eq!(responses[2]["result"]["deleted"], 1);
    assert_eq!(responses[3]["result"]["entities"].as_array().unwrap().len(), 1);
    assert_eq!(responses[3]["result"]["relations"].as_array().unwrap().len(), 0);
    assert_eq!(responses[4]["error"]["code"], "kg::graph::validation");
}
