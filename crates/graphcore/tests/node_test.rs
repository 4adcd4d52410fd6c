use graphcore::{
    handler_fn, router_fn, Node, NodeError, NodeKind, RetryPolicy, StateUpdate, WorkflowState,
    DEFAULT_ROUTE,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn snapshot() -> Arc<WorkflowState> {
    Arc::new(WorkflowState::default())
}

#[tokio::test]
async fn test_always_failing_handler_exhausts_attempts() {
    init_tracing();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn("flaky", move |_state: Arc<WorkflowState>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<StateUpdate, NodeError>(NodeError::ExecutionFailed("boom".to_string()))
        }
    });
    let node = Node::task("worker", handler).with_retry(3, 5);

    let result = node.execute(snapshot()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(result.failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.node_id, "worker");
    assert!(result.error.as_deref().unwrap_or_default().contains("boom"));
    assert!(result.update.is_empty());
}

#[tokio::test]
async fn test_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn("transient", move |_state: Arc<WorkflowState>| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(NodeError::ExecutionFailed("not yet".to_string()));
            }
            Ok(StateUpdate::new().with("next_action", "go"))
        }
    });
    let node = Node::task("worker", handler).with_retry(5, 1);

    let result = node.execute(snapshot()).await;

    assert!(!result.failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(
        result.update.get("next_action").and_then(|v| v.as_str()),
        Some("go")
    );
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn("slow", move |_state: Arc<WorkflowState>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, NodeError>(StateUpdate::new())
        }
    });
    let node = Node::task("slow", handler)
        .with_retry(2, 1)
        .with_timeout(Duration::from_millis(20));

    let result = node.execute(snapshot()).await;

    assert!(result.failed);
    assert_eq!(result.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.error.as_deref().unwrap_or_default().contains("Timeout"));
}

#[tokio::test]
async fn test_panic_is_a_failed_attempt() {
    let handler = handler_fn("panics", |_state: Arc<WorkflowState>| async {
        if true {
            panic!("kaboom");
        }
        Ok::<_, NodeError>(StateUpdate::new())
    });
    let node = Node::task("fragile", handler).with_retry(1, 0);

    let result = node.execute(snapshot()).await;

    assert!(result.failed);
    assert_eq!(result.attempts, 1);
    assert!(result.error.as_deref().unwrap_or_default().contains("kaboom"));
}

#[tokio::test]
async fn test_zero_attempts_runs_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn("once", move |_state: Arc<WorkflowState>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, NodeError>(StateUpdate::new())
        }
    });
    let node = Node::task("once", handler).with_retry(0, 0);

    let result = node.execute(snapshot()).await;

    assert!(!result.failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_backoff_delay() {
    let policy = RetryPolicy {
        max_attempts: 4,
        delay_ms: 100,
        backoff_multiplier: 2.0,
    };

    assert_eq!(policy.delay_after(1), Duration::from_millis(100));
    assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    assert_eq!(RetryPolicy::new(3, 50).delay_after(3), Duration::from_millis(50));
}

#[test]
fn test_routing() {
    let noop = handler_fn("noop", |_state: Arc<WorkflowState>| async {
        Ok::<_, NodeError>(StateUpdate::new())
    });
    let plain = Node::task("plain", Arc::clone(&noop));
    let branch = Node::condition(
        "branch",
        noop,
        router_fn(|state| {
            if state.user_request.is_empty() {
                "empty".to_string()
            } else {
                "work".to_string()
            }
        }),
    );

    let mut state = WorkflowState::default();
    assert_eq!(plain.route(&state), DEFAULT_ROUTE);
    assert_eq!(branch.route(&state), "empty");
    assert_eq!(branch.kind, NodeKind::Condition);

    state.user_request = "do it".to_string();
    assert_eq!(branch.route(&state), "work");
}
