use crate::config::{self, Config};
use async_trait::async_trait;
use graphcore::{NodeError, NodeHandler, StateUpdate, Value, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sets `should_continue` to false, ending the run after this node.
pub struct StopHandler {
    next_action: Option<String>,
}

impl StopHandler {
    pub fn new(next_action: Option<String>) -> Self {
        Self { next_action }
    }
}

#[async_trait]
impl NodeHandler for StopHandler {
    fn handler_type(&self) -> &str {
        "control.stop"
    }

    async fn handle(&self, _state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        let mut update = StateUpdate::new().with("should_continue", false);
        if let Some(action) = &self.next_action {
            update.set("next_action", action.as_str());
        }
        Ok(update)
    }
}

pub struct StopHandlerFactory;

impl HandlerFactory for StopHandlerFactory {
    fn handler_type(&self) -> &str {
        "control.stop"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        Ok(Arc::new(StopHandler::new(config::string(
            config,
            "next_action",
        )?)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Stop the run".to_string(),
            category: "control".to_string(),
        }
    }
}

/// Fails with a fixed message. With `times` set, only the first `times`
/// calls fail and later ones succeed with an empty update.
pub struct FailHandler {
    message: String,
    times: Option<u64>,
    calls: AtomicU64,
}

impl FailHandler {
    pub fn new(message: impl Into<String>, times: Option<u64>) -> Self {
        Self {
            message: message.into(),
            times,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for FailHandler {
    fn handler_type(&self) -> &str {
        "control.fail"
    }

    async fn handle(&self, _state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.times {
            Some(times) if call > times => Ok(StateUpdate::new()),
            _ => Err(NodeError::ExecutionFailed(self.message.clone())),
        }
    }
}

pub struct FailHandlerFactory;

impl HandlerFactory for FailHandlerFactory {
    fn handler_type(&self) -> &str {
        "control.fail"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let message = config::string_or(config, "message", "intentional failure")?;
        let times = config::non_negative(config, "times")?;
        Ok(Arc::new(FailHandler::new(message, times)))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Fail, optionally only for the first N calls".to_string(),
            category: "control".to_string(),
        }
    }
}

/// Bounds a loop: counts passes in an extension key and sets `next_action`
/// to `continue_route` until the `max`-th pass, which routes `exit_route`.
pub struct LoopGuardHandler {
    counter: String,
    max: i64,
    continue_route: String,
    exit_route: String,
}

impl LoopGuardHandler {
    pub fn new(
        counter: impl Into<String>,
        max: i64,
        continue_route: impl Into<String>,
        exit_route: impl Into<String>,
    ) -> Self {
        Self {
            counter: counter.into(),
            max,
            continue_route: continue_route.into(),
            exit_route: exit_route.into(),
        }
    }
}

#[async_trait]
impl NodeHandler for LoopGuardHandler {
    fn handler_type(&self) -> &str {
        "control.loop_guard"
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        let passes = match state.field(&self.counter) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                NodeError::ExecutionFailed(format!(
                    "loop counter '{}' is not an integer",
                    self.counter
                ))
            })?,
        } + 1;

        let route = if passes < self.max {
            &self.continue_route
        } else {
            &self.exit_route
        };
        tracing::debug!("Loop guard pass {}/{} -> {}", passes, self.max, route);

        Ok(StateUpdate::new()
            .with(self.counter.clone(), passes)
            .with("next_action", route.as_str()))
    }
}

pub struct LoopGuardHandlerFactory;

impl HandlerFactory for LoopGuardHandlerFactory {
    fn handler_type(&self) -> &str {
        "control.loop_guard"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let max = config::non_negative(config, "max")?.unwrap_or(3);
        if max == 0 {
            return Err(NodeError::Configuration("'max' must be at least 1".to_string()));
        }
        Ok(Arc::new(LoopGuardHandler::new(
            config::string_or(config, "counter", "loop_count")?,
            max as i64,
            config::string_or(config, "continue_route", "continue")?,
            config::string_or(config, "exit_route", "done")?,
        )))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Count loop passes and route out after max".to_string(),
            category: "control".to_string(),
        }
    }
}
