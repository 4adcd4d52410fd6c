use crate::config::{self, Config};
use async_trait::async_trait;
use graphcore::{NodeError, NodeHandler, StateUpdate, Value, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::sync::Arc;

/// Logs a message and selected state fields; changes nothing.
pub struct DebugHandler {
    message: String,
    fields: Vec<String>,
}

impl DebugHandler {
    pub fn new(message: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            message: message.into(),
            fields,
        }
    }
}

#[async_trait]
impl NodeHandler for DebugHandler {
    fn handler_type(&self) -> &str {
        "debug.log"
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        tracing::info!("DEBUG [{}]: {}", state.current_node, self.message);

        for field in &self.fields {
            let rendered = state
                .field(field)
                .map(|v| serde_json::to_string(&v.to_json()).unwrap_or_default())
                .unwrap_or_else(|| "(unset)".to_string());
            tracing::info!("  {}: {}", field, rendered);
        }

        Ok(StateUpdate::new())
    }
}

pub struct DebugHandlerFactory;

impl HandlerFactory for DebugHandlerFactory {
    fn handler_type(&self) -> &str {
        "debug.log"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let message = config::string_or(config, "message", "(no message)")?;
        let fields = match config.get("fields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        NodeError::Configuration("'fields' must list field names".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(NodeError::Configuration(
                    "'fields' must list field names".to_string(),
                ))
            }
        };
        Ok(Arc::new(DebugHandler::new(message, fields)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Log a message and state fields for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
