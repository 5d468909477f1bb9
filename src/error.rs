//! Rich diagnostic error types for kg-memory.
//!
//! Each layer defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. The codes double as the structured
//! error codes returned to tool callers.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type.
///
/// Each variant wraps a layer-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum KgError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Export(#[from] ExportError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Which storage rule a rejected statement broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// An entity with this name already exists.
    UniqueEntity,
    /// This exact `(from, to, relationType)` triple already exists.
    UniqueRelation,
    /// The entity already carries this observation.
    UniqueObservation,
    /// A referenced entity does not exist.
    ForeignKey,
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::UniqueEntity => write!(f, "unique entity name"),
            Constraint::UniqueRelation => write!(f, "unique relation"),
            Constraint::UniqueObservation => write!(f, "unique observation"),
            Constraint::ForeignKey => write!(f, "foreign key"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(kg::store::io),
        help(
            "A filesystem operation failed. Check that the database directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(kg::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption; try again with a fresh database file. \
             If the problem persists, file a bug report."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(kg::store::serde),
        help(
            "Failed to encode or decode a stored row. \
             The database was probably written by an incompatible version."
        )
    )]
    Serialization { message: String },

    #[error("{constraint} constraint violated: {message}")]
    #[diagnostic(
        code(kg::store::constraint),
        help("The statement conflicts with the current contents of the graph and was not applied.")
    )]
    ConstraintViolation {
        constraint: Constraint,
        message: String,
    },

    #[error("database busy: lock not acquired within {waited_ms} ms")]
    #[diagnostic(
        code(kg::store::busy),
        help(
            "Another writer holds the database. Retry the request, \
             or raise `busy_timeout_ms` if writes are routinely slow."
        )
    )]
    Busy { waited_ms: u64 },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("invalid {field}: {message}")]
    #[diagnostic(
        code(kg::graph::validation),
        help("Fix the request payload; nothing was written.")
    )]
    Validation { field: String, message: String },

    #[error("entity not found: \"{name}\"")]
    #[diagnostic(
        code(kg::graph::entity_not_found),
        help("Create the entity first with `create_entities`, or check the spelling of its name.")
    )]
    EntityNotFound { name: String },

    #[error("relation not found: \"{from}\" -[{relation_type}]-> \"{to}\"")]
    #[diagnostic(
        code(kg::graph::relation_not_found),
        help("No relation with this exact (from, to, relationType) triple exists.")
    )]
    RelationNotFound {
        from: String,
        to: String,
        relation_type: String,
    },

    #[error("constraint violation: {message}")]
    #[diagnostic(
        code(kg::graph::constraint_violation),
        help("The transaction was rolled back and the graph is unchanged.")
    )]
    ConstraintViolation { message: String },

    #[error("knowledge graph busy: lock not acquired within {waited_ms} ms")]
    #[diagnostic(
        code(kg::graph::busy),
        help("The request is safe to retry; nothing was written.")
    )]
    Busy { waited_ms: u64 },

    #[error("storage I/O error: {source}")]
    #[diagnostic(
        code(kg::graph::io),
        help("The database file could not be read or written. The request is safe to retry.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(StoreError),
}

impl GraphError {
    /// Shorthand for a [`GraphError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        GraphError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::Busy { .. } | GraphError::Io { .. })
    }
}

/// Backend failures are translated into the graph taxonomy, never dropped.
impl From<StoreError> for GraphError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation {
                constraint,
                message,
            } => GraphError::ConstraintViolation {
                message: format!("{constraint}: {message}"),
            },
            StoreError::Busy { waited_ms } => GraphError::Busy { waited_ms },
            StoreError::Io { source } => GraphError::Io { source },
            other => GraphError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(kg::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(kg::config::parse),
        help("Check the TOML syntax. Known keys: database_url, busy_timeout_ms, missing_endpoint, cache_enabled.")
    )]
    Parse { path: String, message: String },

    #[error("invalid database url \"{url}\": {message}")]
    #[diagnostic(
        code(kg::config::database_url),
        help("Use `redb:///absolute/path.redb`, `redb://relative/path.redb`, a bare file path, or `:memory:`.")
    )]
    InvalidDatabaseUrl { url: String, message: String },
}

// ---------------------------------------------------------------------------
// Front-end errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    #[diagnostic(
        code(kg::tool::unknown),
        help(
            "Available tools: create_entities, create_relations, add_observations, \
             delete_entities, delete_observations, delete_relations, read_graph, \
             search_nodes, open_nodes, apply_batch."
        )
    )]
    UnknownTool { name: String },

    #[error("invalid arguments for {tool}: {message}")]
    #[diagnostic(
        code(kg::tool::arguments),
        help("Arguments must be a JSON object with exactly the documented fields.")
    )]
    InvalidArguments { tool: String, message: String },

    #[error("malformed request: {message}")]
    #[diagnostic(
        code(kg::tool::request),
        help("Each request line must be a JSON object: {{\"name\": ..., \"arguments\": {{...}}}}.")
    )]
    MalformedRequest { message: String },

    #[error("failed to serialize {tool} result: {message}")]
    #[diagnostic(
        code(kg::tool::serialize),
        help("The call ran but its result could not be encoded as JSON. File a bug report.")
    )]
    Serialization { tool: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Import / export errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ExportError {
    #[error("line {line}: {message}")]
    #[diagnostic(
        code(kg::export::parse),
        help(
            "Each line must be a JSON object tagged with \"type\": \"entity\" or \"relation\". \
             Blank lines are ignored."
        )
    )]
    Parse { line: usize, message: String },

    #[error("I/O error during import/export: {source}")]
    #[diagnostic(code(kg::export::io), help("Check the file path and permissions."))]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(code(kg::export::serde))]
    Serialization { message: String },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for graph manager operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Convenience alias for functions returning kg-memory results.
pub type KgResult<T> = std::result::Result<T, KgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_translates_to_graph_taxonomy() {
        let err = StoreError::ConstraintViolation {
            constraint: Constraint::UniqueEntity,
            message: "Alice".into(),
        };
        let graph: GraphError = err.into();
        match graph {
            GraphError::ConstraintViolation { message } => {
                assert!(message.contains("unique entity name"));
                assert!(message.contains("Alice"));
            }
            other => panic!("unexpected translation: {other:?}"),
        }
    }

    #[test]
    fn busy_stays_retryable() {
        let graph: GraphError = StoreError::Busy { waited_ms: 50 }.into();
        assert!(matches!(graph, GraphError::Busy { waited_ms: 50 }));
        assert!(graph.is_retryable());
        assert!(!GraphError::validation("name", "empty").is_retryable());
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let graph: GraphError = StoreError::Redb {
            message: "commit failed".into(),
        }
        .into();
        assert!(matches!(graph, GraphError::Store(StoreError::Redb { .. })));
        assert!(graph.to_string().contains("commit failed"));
    }

    #[test]
    fn diagnostic_codes_are_exposed() {
        let err = GraphError::EntityNotFound {
            name: "Bob".into(),
        };
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("kg::graph::entity_not_found"));
    }

    #[test]
    fn tool_error_wraps_graph_error() {
        let tool: ToolError = GraphError::validation("query", "empty").into();
        let kg: KgError = tool.into();
        assert!(matches!(
            kg,
            KgError::Tool(ToolError::Graph(GraphError::Validation { .. }))
        ));
    }
}
