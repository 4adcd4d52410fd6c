use crate::config::{self, Config};
use async_trait::async_trait;
use graphcore::{NodeError, NodeHandler, StateUpdate, Value, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stand-in agent that answers with the user request.
///
/// Writes its answer under `agent_outputs.<agent>` and appends
/// `{agent, output}` to `results`.
pub struct EchoAgentHandler {
    agent: String,
    prefix: String,
}

impl EchoAgentHandler {
    pub fn new(agent: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl NodeHandler for EchoAgentHandler {
    fn handler_type(&self) -> &str {
        "agent.echo"
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        let output = format!("{}{}", self.prefix, state.user_request);

        let mut outputs = BTreeMap::new();
        outputs.insert(self.agent.clone(), Value::from(output.as_str()));

        let mut result = BTreeMap::new();
        result.insert("agent".to_string(), Value::from(self.agent.as_str()));
        result.insert("output".to_string(), Value::from(output));

        Ok(StateUpdate::new()
            .with("agent_outputs", outputs)
            .with("results", Value::Object(result)))
    }
}

pub struct EchoAgentHandlerFactory;

impl HandlerFactory for EchoAgentHandlerFactory {
    fn handler_type(&self) -> &str {
        "agent.echo"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let agent = config::string(config, "agent")?
            .ok_or_else(|| NodeError::MissingField("agent".to_string()))?;
        let prefix = config::string_or(config, "prefix", "")?;
        Ok(Arc::new(EchoAgentHandler::new(agent, prefix)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Echo the user request as an agent output".to_string(),
            category: "agent".to_string(),
        }
    }
}
