use crate::config::{self, Config};
use async_trait::async_trait;
use graphcore::{NodeError, NodeHandler, StateUpdate, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::sync::Arc;

/// Writes a fixed set of fields. Each field is folded with its own reducer,
/// so sequences are appended to and mappings merged.
pub struct SetFieldsHandler {
    fields: StateUpdate,
}

impl SetFieldsHandler {
    pub fn new(fields: StateUpdate) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl NodeHandler for SetFieldsHandler {
    fn handler_type(&self) -> &str {
        "state.set"
    }

    async fn handle(&self, _state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        Ok(self.fields.clone())
    }
}

pub struct SetFieldsHandlerFactory;

impl HandlerFactory for SetFieldsHandlerFactory {
    fn handler_type(&self) -> &str {
        "state.set"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        if !config.contains_key("fields") {
            return Err(NodeError::MissingField("fields".to_string()));
        }
        Ok(Arc::new(SetFieldsHandler::new(config::fields(config, "fields")?)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Write the configured fields into state".to_string(),
            category: "transform".to_string(),
        }
    }
}
