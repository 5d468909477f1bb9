//! Tool front-end: strict per-tool argument types over the graph manager.
//!
//! Requests arrive one JSON object per line:
//!
//! ```text
//! {"id": 1, "name": "create_entities", "arguments": {"entities": [...]}}
//! ```
//!
//! and each produces exactly one response line, either
//! `{"id": 1, "result": ...}` or `{"id": 1, "error": {"code", "message", "retryable"}}`.

use std::io::{BufRead, Write};

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::graph::{
    Entity, GraphBatch, ObservationAddition, ObservationDeletion, OptimizedGraphManager, Relation,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRequest {
    /// Echoed back unchanged so callers can match responses.
    #[serde(default)]
    pub id: Option<Value>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntitiesArgs {
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationsArgs {
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddObservationsArgs {
    pub observations: Vec<ObservationAddition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteEntitiesArgs {
    pub entity_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteObservationsArgs {
    pub deletions: Vec<ObservationDeletion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchNodesArgs {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenNodesArgs {
    pub names: Vec<String>,
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    CreateEntities(CreateEntitiesArgs),
    CreateRelations(RelationsArgs),
    AddObservations(AddObservationsArgs),
    DeleteEntities(DeleteEntitiesArgs),
    DeleteObservations(DeleteObservationsArgs),
    DeleteRelations(RelationsArgs),
    ReadGraph,
    SearchNodes(SearchNodesArgs),
    OpenNodes(OpenNodesArgs),
    ApplyBatch(GraphBatch),
}

impl ToolCall {
    /// Every tool name accepted by [`ToolCall::parse`].
    pub const NAMES: [&'static str; 10] = [
        "create_entities",
        "create_relations",
        "add_observations",
        "delete_entities",
        "delete_observations",
        "delete_relations",
        "read_graph",
        "search_nodes",
        "open_nodes",
        "apply_batch",
    ];

    /// Deserialize `arguments` into the strict argument type for `name`.
    ///
    /// Pure: nothing touches the graph.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, ToolError> {
        Ok(match name {
            "create_entities" => ToolCall::CreateEntities(args(name, arguments)?),
            "create_relations" => ToolCall::CreateRelations(args(name, arguments)?),
            "add_observations" => ToolCall::AddObservations(args(name, arguments)?),
            "delete_entities" => ToolCall::DeleteEntities(args(name, arguments)?),
            "delete_observations" => ToolCall::DeleteObservations(args(name, arguments)?),
            "delete_relations" => ToolCall::DeleteRelations(args(name, arguments)?),
            "read_graph" => match arguments {
                Value::Null => ToolCall::ReadGraph,
                Value::Object(map) if map.is_empty() => ToolCall::ReadGraph,
                _ => {
                    return Err(ToolError::InvalidArguments {
                        tool: name.to_string(),
                        message: "read_graph takes no arguments".into(),
                    });
                }
            },
            "search_nodes" => ToolCall::SearchNodes(args(name, arguments)?),
            "open_nodes" => ToolCall::OpenNodes(args(name, arguments)?),
            "apply_batch" => ToolCall::ApplyBatch(args(name, arguments)?),
            _ => {
                return Err(ToolError::UnknownTool {
                    name: name.to_string(),
                });
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::CreateEntities(_) => "create_entities",
            ToolCall::CreateRelations(_) => "create_relations",
            ToolCall::AddObservations(_) => "add_observations",
            ToolCall::DeleteEntities(_) => "delete_entities",
            ToolCall::DeleteObservations(_) => "delete_observations",
            ToolCall::DeleteRelations(_) => "delete_relations",
            ToolCall::ReadGraph => "read_graph",
            ToolCall::SearchNodes(_) => "search_nodes",
            ToolCall::OpenNodes(_) => "open_nodes",
            ToolCall::ApplyBatch(_) => "apply_batch",
        }
    }

    /// Run the call against `manager` and serialize the result.
    pub fn invoke(&self, manager: &OptimizedGraphManager) -> Result<Value, ToolError> {
        let tool = self.name();
        match self {
            ToolCall::CreateEntities(a) => to_value(tool, manager.create_entities(&a.entities)?),
            ToolCall::CreateRelations(a) => {
                to_value(tool, manager.create_relations(&a.relations)?)
            }
            ToolCall::AddObservations(a) => {
                to_value(tool, manager.add_observations_many(&a.observations)?)
            }
            ToolCall::DeleteEntities(a) => {
                Ok(json!({ "deleted": manager.delete_entities(&a.entity_names)? }))
            }
            ToolCall::DeleteObservations(a) => {
                Ok(json!({ "deleted": manager.delete_observations_many(&a.deletions)? }))
            }
            ToolCall::DeleteRelations(a) => {
                Ok(json!({ "deleted": manager.delete_relations(&a.relations)? }))
            }
            ToolCall::ReadGraph => to_value(tool, manager.read_graph()?),
            ToolCall::SearchNodes(a) => to_value(tool, manager.search_nodes(&a.query)?),
            ToolCall::OpenNodes(a) => to_value(tool, manager.open_nodes(&a.names)?),
            ToolCall::ApplyBatch(batch) => to_value(tool, manager.apply_batch(batch)?),
        }
    }
}

fn args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

fn to_value<T: Serialize>(tool: &str, value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Serialization {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// The `error` object of a failed response.
pub fn error_body(err: &ToolError) -> Value {
    let code = err
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "kg::tool::error".to_string());
    let retryable = matches!(err, ToolError::Graph(graph) if graph.is_retryable());
    json!({ "code": code, "message": err.to_string(), "retryable": retryable })
}

/// Handle one request line. Returns `None` for blank lines.
pub fn handle_line(manager: &OptimizedGraphManager, line: &str) -> Option<Value> {
    if line.trim().is_empty() {
        return None;
    }

    let request: ToolRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            let err = ToolError::MalformedRequest {
                message: e.to_string(),
            };
            return Some(json!({ "id": Value::Null, "error": error_body(&err) }));
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    let outcome =
        ToolCall::parse(&request.name, request.arguments).and_then(|call| {
            let span = tracing::debug_span!("tool", name = call.name());
            let _enter = span.enter();
            call.invoke(manager)
        });

    Some(match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(err) => {
            tracing::debug!(tool = %request.name, error = %err, "tool call failed");
            json!({ "id": id, "error": error_body(&err) })
        }
    })
}

/// Serve requests from `input` until EOF, writing one response line each.
///
/// Returns the number of requests handled.
pub fn serve(
    manager: &OptimizedGraphManager,
    input: impl BufRead,
    mut output: impl Write,
) -> std::io::Result<usize> {
    let mut handled = 0;
    for line in input.lines() {
        let line = line?;
        let Some(response) = handle_line(manager, &line) else {
            continue;
        };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        handled += 1;
    }
    tracing::info!(handled, "input closed, stopping");
    Ok(handled)
}
