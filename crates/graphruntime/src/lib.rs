//! Graph execution runtime
//!
//! This crate provides the engine that drives compiled graphs, the template
//! and handler registries, JSON graph definitions, and the orchestrator that
//! runs many instances concurrently.

mod error;
mod executor;
mod loader;
mod orchestrator;
mod registry;

pub use error::{DefinitionError, OrchestratorError};
pub use executor::{
    ExecutionResult, GraphExecutor, InstanceProgress, RunControl, DEFAULT_MAX_ITERATIONS,
    FAILURE_ROUTE,
};
pub use loader::{
    DefinitionLoader, DefinitionTemplate, GraphDefinition, HandlerSpec, NodeDefinition,
};
pub use orchestrator::{
    InstanceInput, InstanceStatus, InstanceSummary, Orchestrator, RuntimeConfig, StatusReport,
};
pub use registry::{
    HandlerFactory, HandlerMetadata, HandlerRegistry, Template, TemplateConfig, TemplateInfo,
    TemplateRegistry,
};
