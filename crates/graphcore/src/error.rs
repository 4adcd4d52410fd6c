use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Invalid value for '{field}': expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Field '{0}' is read-only")]
    ReadOnlyField(String),

    #[error("Cannot roll back {requested} checkpoint(s): only {available} available")]
    InsufficientCheckpoints { requested: usize, available: usize },
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Entry point must be set")]
    MissingEntryPoint,

    #[error("Entry point '{0}' is not a node of the graph")]
    UnknownEntryPoint(String),

    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Graph must be compiled before execution")]
    NotCompiled,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid graph: {0}")]
    Invalid(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Branch task failed: {0}")]
    TaskJoin(String),
}
