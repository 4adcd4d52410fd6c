//! Core abstractions for the graph engine
//!
//! Versioned workflow state, nodes with retry/timeout semantics, and the
//! graph structure with its compiler. Execution lives in `graphruntime`.

mod error;
pub mod events;
mod graph;
mod node;
mod state;
mod value;

pub use error::{EngineError, GraphError, NodeError, StateError};
pub use events::*;
pub use graph::{Edge, Graph, LogEntry, RunStatus};
pub use node::{
    handler_fn, router_fn, FieldRouter, JoinPolicy, Node, NodeHandler, NodeKind, NodeResult,
    RetryPolicy, Router, DEFAULT_ROUTE,
};
pub use state::{
    Checkpoint, ErrorRecord, InstanceId, Operator, StateManager, StateUpdate, WorkflowState,
    MAPPING_FIELDS, SEQUENCE_FIELDS,
};
pub use value::Value;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
