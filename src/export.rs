//! Line-delimited JSON import and export.
//!
//! One record per line, tagged with `"type"`:
//!
//! ```text
//! {"type":"entity","name":"Alice","entityType":"Person","observations":["likes tea"]}
//! {"type":"relation","from":"Alice","to":"Bob","relationType":"knows"}
//! ```
//!
//! Entities are written before relations so a file can be replayed in order.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::graph::{Entity, GraphBatch, KnowledgeGraph, Relation};

/// One line of an export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphRecord {
    Entity(Entity),
    Relation(Relation),
}

/// Write `graph` as JSONL, returning the number of lines written.
pub fn write_jsonl(graph: &KnowledgeGraph, mut out: impl Write) -> Result<usize, ExportError> {
    let records = graph
        .entities
        .iter()
        .cloned()
        .map(GraphRecord::Entity)
        .chain(graph.relations.iter().cloned().map(GraphRecord::Relation));

    let mut lines = 0;
    for record in records {
        serde_json::to_writer(&mut out, &record).map_err(|e| ExportError::Serialization {
            message: e.to_string(),
        })?;
        out.write_all(b"\n")
            .map_err(|e| ExportError::Io { source: e })?;
        lines += 1;
    }
    out.flush().map_err(|e| ExportError::Io { source: e })?;
    Ok(lines)
}

/// Read JSONL records into a batch that recreates them.
///
/// Blank lines are skipped. Errors carry the 1-based line number.
pub fn read_jsonl(input: impl BufRead) -> Result<GraphBatch, ExportError> {
    let mut batch = GraphBatch::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.map_err(|e| ExportError::Io { source: e })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: GraphRecord =
            serde_json::from_str(&line).map_err(|e| ExportError::Parse {
                line: idx + 1,
                message: e.to_string(),
            })?;
        match record {
            GraphRecord::Entity(entity) => batch.entities.push(entity),
            GraphRecord::Relation(relation) => batch.relations.push(relation),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_writes_entities_then_relations() {
        let graph = KnowledgeGraph {
            entities: vec![
                Entity::new("Alice", "Person").with_observations(["likes tea"]),
                Entity::new("Bob", "Person"),
            ],
            relations: vec![Relation::new("Alice", "Bob", "knows")],
        };
        let mut buf = Vec::new();
        assert_eq!(write_jsonl(&graph, &mut buf).unwrap(), 3);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"type":"entity","name":"Alice","entityType":"Person","observations":["likes tea"]}"#
        );
        assert_eq!(
            lines[2],
            r#"{"type":"relation","from":"Alice","to":"Bob","relationType":"knows"}"#
        );
    }

    #[test]
    fn import_builds_a_batch_and_skips_blank_lines() {
        let input = concat!(
            r#"{"type":"entity","name":"Alice","entityType":"Person"}"#,
            "\n\n",
            r#"{"type":"relation","from":"Alice","to":"Alice","relationType":"is"}"#,
            "\n",
        );
        let batch = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(batch.entities, vec![Entity::new("Alice", "Person")]);
        assert_eq!(batch.relations.len(), 1);
    }

    #[test]
    fn import_reports_the_failing_line() {
        let input = concat!(
            r#"{"type":"entity","name":"Alice","entityType":"Person"}"#,
            "\n",
            r#"{"type":"node","name":"Bob"}"#,
            "\n",
        );
        let err = read_jsonl(input.as_bytes()).unwrap_err();
        assert!(matches!(err, ExportError::Parse { line: 2, .. }));
    }
}
