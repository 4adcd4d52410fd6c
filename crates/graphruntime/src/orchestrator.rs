use crate::executor::{
    ExecutionResult, GraphExecutor, InstanceProgress, RunControl, DEFAULT_MAX_ITERATIONS,
};
use crate::registry::{Template, TemplateConfig, TemplateInfo, TemplateRegistry};
use crate::OrchestratorError;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use graphcore::{
    EventBus, ExecutionEvent, GraphError, InstanceId, LogEntry, RunStatus, Value, WorkflowState,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Node visits allowed per instance
    pub max_iterations: usize,
    pub event_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            event_buffer_size: 1000,
        }
    }
}

/// Input used to seed the initial state of an instance
#[derive(Debug, Clone, Default)]
pub struct InstanceInput {
    pub project_id: String,
    pub user_request: String,
    pub context: BTreeMap<String, Value>,
}

impl InstanceInput {
    pub fn new(project_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_request: user_request.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Aborted,
    Cancelled,
    /// The run ended with an error or a panic
    Failed,
}

impl InstanceStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl From<RunStatus> for InstanceStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => InstanceStatus::Completed,
            RunStatus::Aborted => InstanceStatus::Aborted,
            RunStatus::Cancelled => InstanceStatus::Cancelled,
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub template_id: String,
    pub status: InstanceStatus,
    pub state: Arc<WorkflowState>,
    pub execution_log: Vec<LogEntry>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub template_id: String,
    pub status: InstanceStatus,
}

struct ActiveInstance {
    template_id: String,
    progress: watch::Receiver<InstanceProgress>,
    done: watch::Receiver<bool>,
    cancellation: CancellationToken,
}

/// Finished instance; never mutated once recorded.
struct InstanceRecord {
    template_id: String,
    status: InstanceStatus,
    state: Arc<WorkflowState>,
    execution_log: Vec<LogEntry>,
    error: Option<String>,
    finished_at: DateTime<Utc>,
    elapsed_ms: u64,
}

impl InstanceRecord {
    fn report(&self, instance_id: InstanceId) -> StatusReport {
        StatusReport {
            instance_id,
            template_id: self.template_id.clone(),
            status: self.status,
            state: Arc::clone(&self.state),
            execution_log: self.execution_log.clone(),
            error: self.error.clone(),
            finished_at: Some(self.finished_at),
            elapsed_ms: Some(self.elapsed_ms),
        }
    }
}

#[derive(Default)]
struct InstanceTable {
    active: HashMap<InstanceId, ActiveInstance>,
    history: HashMap<InstanceId, InstanceRecord>,
}

/// Creates instances from templates and runs each one as a background task
pub struct Orchestrator {
    templates: Arc<RwLock<TemplateRegistry>>,
    executor: Arc<GraphExecutor>,
    event_bus: Arc<EventBus>,
    instances: Arc<RwLock<InstanceTable>>,
}

impl Orchestrator {
    /// Create an orchestrator with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(TemplateRegistry::new(), config)
    }

    /// Create an orchestrator with a pre-populated template registry
    pub fn with_registry(registry: TemplateRegistry, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(GraphExecutor::new(
            config.max_iterations,
            Arc::clone(&event_bus),
        ));

        Self {
            templates: Arc::new(RwLock::new(registry)),
            executor,
            event_bus,
            instances: Arc::new(RwLock::new(InstanceTable::default())),
        }
    }

    pub async fn register_template(&self, template: Arc<dyn Template>) {
        self.templates.write().await.register(template);
    }

    pub async fn list_templates(&self) -> Vec<TemplateInfo> {
        self.templates.read().await.list()
    }

    /// Build, compile and start an instance of `template_id`.
    ///
    /// Returns as soon as the instance is registered as active; execution
    /// continues in the background.
    pub async fn create(
        &self,
        template_id: &str,
        input: InstanceInput,
        config: TemplateConfig,
    ) -> Result<InstanceId, OrchestratorError> {
        let template = self
            .templates
            .read()
            .await
            .get(template_id)
            .ok_or_else(|| OrchestratorError::UnknownTemplate(template_id.to_string()))?;

        let mut graph = template.build_graph(&config)?;
        graph.compile()?;
        let instance_id = graph.instance_id();

        let initial_state = WorkflowState::new(instance_id, template_id)
            .with_project(input.project_id)
            .with_request(input.user_request)
            .with_context(input.context);

        let (progress_tx, progress_rx) =
            watch::channel(InstanceProgress::new(Arc::new(initial_state.clone())));
        let (done_tx, done_rx) = watch::channel(false);
        let cancellation = CancellationToken::new();

        self.instances.write().await.active.insert(
            instance_id,
            ActiveInstance {
                template_id: template_id.to_string(),
                progress: progress_rx,
                done: done_rx,
                cancellation: cancellation.clone(),
            },
        );
        tracing::info!("Created instance {} from template {}", instance_id, template_id);

        let executor = Arc::clone(&self.executor);
        let event_bus = Arc::clone(&self.event_bus);
        let instances = Arc::clone(&self.instances);

        tokio::spawn(async move {
            let started = Instant::now();
            let control = RunControl {
                progress: Some(progress_tx),
                cancellation,
            };
            let outcome = AssertUnwindSafe(executor.run_with(&graph, initial_state, control))
                .catch_unwind()
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let outcome = match outcome {
                Ok(result) => result,
                Err(panic) => Err(GraphError::TaskJoin(panic_message(panic))),
            };

            let mut table = instances.write().await;
            let Some(active) = table.active.remove(&instance_id) else {
                tracing::error!("Instance {} vanished from the active table", instance_id);
                return;
            };
            let record = finish(&active, outcome, elapsed_ms, &event_bus, instance_id);
            table.history.insert(instance_id, record);
            drop(table);

            let _ = done_tx.send(true);
        });

        Ok(instance_id)
    }

    /// Current view of an instance, active or historical.
    pub async fn get_status(
        &self,
        instance_id: InstanceId,
    ) -> Result<StatusReport, OrchestratorError> {
        let table = self.instances.read().await;
        if let Some(active) = table.active.get(&instance_id) {
            let progress = active.progress.borrow().clone();
            return Ok(StatusReport {
                instance_id,
                template_id: active.template_id.clone(),
                status: InstanceStatus::Running,
                state: progress.state,
                execution_log: progress.log,
                error: None,
                finished_at: None,
                elapsed_ms: None,
            });
        }
        table
            .history
            .get(&instance_id)
            .map(|record| record.report(instance_id))
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))
    }

    /// Wait until the instance has finished and return its final report.
    pub async fn wait(&self, instance_id: InstanceId) -> Result<StatusReport, OrchestratorError> {
        let done = {
            let table = self.instances.read().await;
            table.active.get(&instance_id).map(|a| a.done.clone())
        };
        if let Some(mut done) = done {
            // A dropped sender means the task is gone; the table says why.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_status(instance_id).await
    }

    /// Request cancellation. Returns `false` if the instance already finished.
    pub async fn cancel(&self, instance_id: InstanceId) -> Result<bool, OrchestratorError> {
        let table = self.instances.read().await;
        if let Some(active) = table.active.get(&instance_id) {
            tracing::info!("Cancelling instance {}", instance_id);
            active.cancellation.cancel();
            return Ok(true);
        }
        if table.history.contains_key(&instance_id) {
            return Ok(false);
        }
        Err(OrchestratorError::InstanceNotFound(instance_id))
    }

    /// Active and historical instances
    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let table = self.instances.read().await;
        let mut summaries: Vec<InstanceSummary> = table
            .active
            .iter()
            .map(|(id, active)| InstanceSummary {
                instance_id: *id,
                template_id: active.template_id.clone(),
                status: InstanceStatus::Running,
            })
            .chain(table.history.iter().map(|(id, record)| InstanceSummary {
                instance_id: *id,
                template_id: record.template_id.clone(),
                status: record.status,
            }))
            .collect();
        summaries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        summaries
    }

    /// Subscribe to execution events of every instance
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(
    active: &ActiveInstance,
    outcome: Result<ExecutionResult, GraphError>,
    elapsed_ms: u64,
    event_bus: &EventBus,
    instance_id: InstanceId,
) -> InstanceRecord {
    match outcome {
        Ok(result) => {
            let mut state = (*result.state).clone();
            state.execution_time_ms = elapsed_ms as i64;
            InstanceRecord {
                template_id: active.template_id.clone(),
                status: result.status.into(),
                state: Arc::new(state),
                execution_log: result.log,
                error: None,
                finished_at: Utc::now(),
                elapsed_ms,
            }
        }
        Err(e) => {
            tracing::error!("Instance {} failed: {}", instance_id, e);
            event_bus.emit(ExecutionEvent::InstanceFailed {
                instance_id,
                error: e.to_string(),
                timestamp: Utc::now(),
            });

            let progress = active.progress.borrow().clone();
            let mut state = (*progress.state).clone();
            state.execution_time_ms = elapsed_ms as i64;
            InstanceRecord {
                template_id: active.template_id.clone(),
                status: InstanceStatus::Failed,
                state: Arc::new(state),
                execution_log: progress.log,
                error: Some(e.to_string()),
                finished_at: Utc::now(),
                elapsed_ms,
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("instance panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("instance panicked: {}", s)
    } else {
        "instance panicked".to_string()
    }
}
