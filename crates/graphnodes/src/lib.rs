//! Standard handler library
//!
//! Collection of built-in handlers usable from graph definitions

mod agent;
mod config;
mod control;
mod debug;
mod quality;
mod time;
mod transform;

pub use agent::EchoAgentHandler;
pub use control::{FailHandler, LoopGuardHandler, StopHandler};
pub use debug::DebugHandler;
pub use quality::QualityCheckHandler;
pub use time::DelayHandler;
pub use transform::SetFieldsHandler;
use graphruntime::HandlerRegistry;

use std::sync::Arc;

/// Register all standard handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(agent::EchoAgentHandlerFactory));
    registry.register(Arc::new(control::FailHandlerFactory));
    registry.register(Arc::new(control::LoopGuardHandlerFactory));
    registry.register(Arc::new(control::StopHandlerFactory));
    registry.register(Arc::new(debug::DebugHandlerFactory));
    registry.register(Arc::new(quality::QualityCheckHandlerFactory));
    registry.register(Arc::new(time::DelayHandlerFactory));
    registry.register(Arc::new(transform::SetFieldsHandlerFactory));
}

/// Registry preloaded with every standard handler
pub fn standard_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_all(&mut registry);
    registry
}
