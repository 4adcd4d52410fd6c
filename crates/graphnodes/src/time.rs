use crate::config::{self, Config};
use async_trait::async_trait;
use graphcore::{NodeError, NodeHandler, StateUpdate, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Sleep, then emit the configured fields
pub struct DelayHandler {
    delay: Duration,
    fields: StateUpdate,
}

impl DelayHandler {
    pub fn new(delay: Duration, fields: StateUpdate) -> Self {
        Self { delay, fields }
    }
}

#[async_trait]
impl NodeHandler for DelayHandler {
    fn handler_type(&self) -> &str {
        "time.delay"
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        tracing::debug!(
            "Delaying {} for {}ms",
            state.current_node,
            self.delay.as_millis()
        );
        sleep(self.delay).await;
        Ok(self.fields.clone())
    }
}

pub struct DelayHandlerFactory;

impl HandlerFactory for DelayHandlerFactory {
    fn handler_type(&self) -> &str {
        "time.delay"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        // Default to 1 second if not specified
        let delay_ms = config::non_negative(config, "delay_ms")?.unwrap_or(1000);
        let fields = config::fields(config, "fields")?;
        Ok(Arc::new(DelayHandler::new(
            Duration::from_millis(delay_ms),
            fields,
        )))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Delay for delay_ms milliseconds, then write fields".to_string(),
            category: "time".to_string(),
        }
    }
}
