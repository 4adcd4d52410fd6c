use graphcore::{GraphError, InstanceId, NodeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Unknown handler type: {0}")]
    UnknownHandlerType(String),

    #[error("Failed to create handler '{handler_type}': {source}")]
    Handler {
        handler_type: String,
        #[source]
        source: NodeError,
    },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
