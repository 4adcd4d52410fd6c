use crate::{NodeError, StateUpdate, Value, WorkflowState};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

/// Label returned by [`Node::route`] when a node has no router
pub const DEFAULT_ROUTE: &str = "default";

/// What a node does in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain unit of work
    Task,
    /// Picks one outgoing edge by label
    Condition,
    /// Runs every outgoing edge concurrently
    FanOut,
    /// Barrier waiting for the branches of its fan-out
    FanIn,
    /// Human-in-the-loop checkpoint
    Human,
    /// Data transformation
    Transform,
    /// Quality check
    QualityCheck,
}

impl NodeKind {
    pub fn is_branching(&self) -> bool {
        matches!(self, NodeKind::Condition)
    }
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        let multiplier = self.backoff_multiplier;
        if attempt <= 1 || !multiplier.is_finite() || multiplier <= 0.0 {
            return base;
        }
        let factor = multiplier.powi(attempt as i32 - 1);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 1.0,
        }
    }
}

/// How a fan-in node treats branches that never reach it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every branch must arrive, otherwise the fan-in is skipped
    #[default]
    RequireAll,
    /// Run once all branches settled, with whatever arrived
    AllowPartial,
}

/// Work performed by a node: snapshot in, partial update out
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Type identifier (e.g. "state.set", "time.delay")
    fn handler_type(&self) -> &str;

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError>;
}

/// Routing function of a condition node
pub trait Router: Send + Sync {
    fn route(&self, state: &WorkflowState) -> String;
}

/// Routes on the string value of a state field; `next_action` by default.
#[derive(Debug, Clone)]
pub struct FieldRouter {
    field: String,
}

impl FieldRouter {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Default for FieldRouter {
    fn default() -> Self {
        Self::new("next_action")
    }
}

impl Router for FieldRouter {
    fn route(&self, state: &WorkflowState) -> String {
        match state.field(&self.field) {
            Some(Value::String(label)) => label,
            _ => DEFAULT_ROUTE.to_string(),
        }
    }
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(Arc<WorkflowState>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send,
{
    fn handler_type(&self) -> &str {
        &self.name
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        (self.f)(state).await
    }
}

/// Wrap an async closure as a named handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(Arc<WorkflowState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

struct FnRouter<F>(F);

impl<F> Router for FnRouter<F>
where
    F: Fn(&WorkflowState) -> String + Send + Sync,
{
    fn route(&self, state: &WorkflowState) -> String {
        (self.0)(state)
    }
}

/// Wrap a closure as a router.
pub fn router_fn<F>(f: F) -> Arc<dyn Router>
where
    F: Fn(&WorkflowState) -> String + Send + Sync + 'static,
{
    Arc::new(FnRouter(f))
}

/// Outcome of [`Node::execute`]. Failure is a value, never an error.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: String,
    pub update: StateUpdate,
    pub failed: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl NodeResult {
    pub fn success(node_id: impl Into<String>, update: StateUpdate, attempts: u32) -> Self {
        Self {
            node_id: node_id.into(),
            update,
            failed: false,
            error: None,
            attempts,
            duration_ms: 0,
        }
    }

    pub fn failure(node_id: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            node_id: node_id.into(),
            update: StateUpdate::new(),
            failed: true,
            error: Some(error.into()),
            attempts,
            duration_ms: 0,
        }
    }

    fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// A named unit of work in a graph
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub join_policy: JoinPolicy,
    pub metadata: BTreeMap<String, Value>,
    handler: Arc<dyn NodeHandler>,
    router: Option<Arc<dyn Router>>,
}

impl Node {
    /// Default per-attempt timeout (5 minutes)
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(id: impl Into<String>, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            retry: RetryPolicy::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            join_policy: JoinPolicy::default(),
            metadata: BTreeMap::new(),
            handler,
            router: None,
        }
    }

    pub fn task(id: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self::new(id, NodeKind::Task, handler)
    }

    pub fn condition(
        id: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self::new(id, NodeKind::Condition, handler).with_router(router)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = RetryPolicy::new(max_attempts, delay_ms);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn handler_type(&self) -> &str {
        self.handler.handler_type()
    }

    /// Run the handler with retries; each attempt is bounded by `timeout`.
    ///
    /// A timed-out attempt is dropped, which cancels whatever it was
    /// awaiting. Errors, timeouts and panics all count as failed attempts.
    pub async fn execute(&self, state: Arc<WorkflowState>) -> NodeResult {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let call = AssertUnwindSafe(self.handler.handle(Arc::clone(&state))).catch_unwind();
            let error = match timeout(self.timeout, call).await {
                Ok(Ok(Ok(update))) => {
                    return NodeResult::success(&self.id, update, attempt).timed(started);
                }
                Ok(Ok(Err(e))) => e,
                Ok(Err(panic)) => NodeError::Panicked(panic_message(panic)),
                Err(_) => NodeError::Timeout {
                    millis: self.timeout.as_millis() as u64,
                },
            };

            tracing::warn!(
                "Node {} attempt {}/{} failed: {}",
                self.id,
                attempt,
                max_attempts,
                error
            );
            last_error = Some(error);

            if attempt < max_attempts {
                sleep(self.retry.delay_after(attempt)).await;
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        NodeResult::failure(&self.id, message, max_attempts).timed(started)
    }

    /// Label of the outgoing edge to follow; [`DEFAULT_ROUTE`] without a router.
    pub fn route(&self, state: &WorkflowState) -> String {
        match &self.router {
            Some(router) => router.route(state),
            None => DEFAULT_ROUTE.to_string(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("handler", &self.handler.handler_type())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("has_router", &self.router.is_some())
            .finish()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
