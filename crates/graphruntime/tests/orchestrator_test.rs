use graphcore::{
    handler_fn, router_fn, ExecutionEvent, Graph, GraphError, Node, NodeError, StateUpdate,
    Value, WorkflowState,
};
use graphruntime::{
    InstanceInput, InstanceStatus, Orchestrator, OrchestratorError, RuntimeConfig, Template,
    TemplateConfig, TemplateRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

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

struct FnTemplate {
    id: &'static str,
    build: fn(&TemplateConfig) -> Result<Graph, GraphError>,
}

impl Template for FnTemplate {
    fn template_id(&self) -> &str {
        self.id
    }

    fn template_name(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        "test template"
    }

    fn build_graph(&self, config: &TemplateConfig) -> Result<Graph, GraphError> {
        (self.build)(config)
    }
}

/// echo -> sleep(delay_ms from config, default 10) -> done
fn echo_graph(config: &TemplateConfig) -> Result<Graph, GraphError> {
    let delay_ms = config
        .get("delay_ms")
        .and_then(Value::as_i64)
        .unwrap_or(10) as u64;

    let echo = handler_fn("echo", |state: Arc<WorkflowState>| async move {
        Ok::<_, NodeError>(StateUpdate::new().with("results", state.user_request.as_str()))
    });
    let sleep = handler_fn("sleep", move |_state| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok::<_, NodeError>(StateUpdate::new())
    });
    let done = handler_fn("done", |_state| async { Ok::<_, NodeError>(StateUpdate::new()) });

    let mut graph = Graph::new("echo");
    graph
        .add_node(Node::task("echo", echo))
        .add_node(Node::task("sleep", sleep))
        .add_node(Node::task("done", done))
        .connect("echo", "sleep")
        .connect("sleep", "done")
        .set_entry_point("echo");
    Ok(graph)
}

fn cycle_graph(_config: &TemplateConfig) -> Result<Graph, GraphError> {
    let noop = handler_fn("noop", |_state| async { Ok::<_, NodeError>(StateUpdate::new()) });
    let mut graph = Graph::new("cycle");
    graph
        .add_node(Node::task("spin", noop))
        .connect("spin", "spin")
        .set_entry_point("spin");
    Ok(graph)
}

fn panicking_router_graph(_config: &TemplateConfig) -> Result<Graph, GraphError> {
    let noop = handler_fn("noop", |_state| async { Ok::<_, NodeError>(StateUpdate::new()) });
    let mut graph = Graph::new("panics");
    graph
        .add_node(Node::task("work", Arc::clone(&noop)))
        .add_node(Node::condition(
            "route",
            noop,
            router_fn(|_state| panic!("router exploded")),
        ))
        .connect("work", "route")
        .set_entry_point("work");
    Ok(graph)
}

fn no_entry_graph(_config: &TemplateConfig) -> Result<Graph, GraphError> {
    let noop = handler_fn("noop", |_state| async { Ok::<_, NodeError>(StateUpdate::new()) });
    let mut graph = Graph::new("broken");
    graph.add_node(Node::task("lonely", noop));
    Ok(graph)
}

fn orchestrator(max_iterations: usize) -> Orchestrator {
    let mut registry = TemplateRegistry::new();
    for (id, build) in [
        ("echo", echo_graph as fn(&TemplateConfig) -> Result<Graph, GraphError>),
        ("cycle", cycle_graph),
        ("panics", panicking_router_graph),
        ("broken", no_entry_graph),
    ] {
        registry.register(Arc::new(FnTemplate { id, build }));
    }
    Orchestrator::with_registry(
        registry,
        RuntimeConfig::default().with_max_iterations(max_iterations),
    )
}

fn delay(ms: i64) -> TemplateConfig {
    let mut config = TemplateConfig::new();
    config.insert("delay_ms".to_string(), Value::from(ms));
    config
}

#[tokio::test]
async fn test_unknown_template_is_rejected() {
    let orch = orchestrator(100);

    let err = orch
        .create("missing", InstanceInput::default(), TemplateConfig::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnknownTemplate(ref id) if id == "missing"));
    assert!(orch.list_instances().await.is_empty());
}

#[tokio::test]
async fn test_compile_error_prevents_start() {
    let orch = orchestrator(100);

    let err = orch
        .create("broken", InstanceInput::default(), TemplateConfig::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Graph(GraphError::MissingEntryPoint)
    ));
    assert!(orch.list_instances().await.is_empty());
}

#[tokio::test]
async fn test_status_lifecycle() {
    init_tracing();
    let orch = orchestrator(100);

    let err = orch.get_status(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InstanceNotFound(_)));

    let input = InstanceInput::new("proj-1", "write docs").with_context("lang", "rust");
    let id = orch.create("echo", input, delay(300)).await.unwrap();

    let running = orch.get_status(id).await.unwrap();
    assert_eq!(running.status, InstanceStatus::Running);
    assert!(!running.status.is_finished());
    assert_eq!(running.template_id, "echo");
    assert!(running.finished_at.is_none());

    let finished = orch.wait(id).await.unwrap();
    assert_eq!(finished.status, InstanceStatus::Completed);
    assert!(finished.status.is_finished());
    assert!(finished.error.is_none());
    assert_eq!(finished.execution_log.len(), 3);
    assert!(finished.finished_at.is_some());

    let state = &finished.state;
    assert_eq!(state.instance_id, id);
    assert_eq!(state.template_id, "echo");
    assert_eq!(state.project_id, "proj-1");
    assert_eq!(state.user_context.get("lang"), Some(&Value::from("rust")));
    assert_eq!(state.results, vec![Value::from("write docs")]);
    assert_eq!(state.completed_tasks, vec!["echo", "sleep", "done"]);
    assert_eq!(Some(state.execution_time_ms as u64), finished.elapsed_ms);
    assert!(state.execution_time_ms >= 300);

    // History is stable once recorded
    let again = orch.get_status(id).await.unwrap();
    assert_eq!(again.finished_at, finished.finished_at);
    assert_eq!(*again.state, *finished.state);
}

#[tokio::test]
async fn test_runaway_instance_is_aborted() {
    let orch = orchestrator(5);

    let id = orch
        .create("cycle", InstanceInput::default(), TemplateConfig::new())
        .await
        .unwrap();
    let report = orch.wait(id).await.unwrap();

    assert_eq!(report.status, InstanceStatus::Aborted);
    assert_eq!(report.execution_log.len(), 5);
}

#[tokio::test]
async fn test_panicking_instance_does_not_affect_others() {
    init_tracing();
    let orch = orchestrator(100);
    let mut events = orch.subscribe_events();

    let bad = orch
        .create("panics", InstanceInput::default(), TemplateConfig::new())
        .await
        .unwrap();
    let good = orch
        .create("echo", InstanceInput::new("p", "still fine"), delay(20))
        .await
        .unwrap();

    let bad_report = orch.wait(bad).await.unwrap();
    let good_report = orch.wait(good).await.unwrap();

    assert_eq!(bad_report.status, InstanceStatus::Failed);
    assert!(bad_report
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("router exploded"));
    assert_eq!(bad_report.state.completed_tasks, vec!["work", "route"]);

    assert_eq!(good_report.status, InstanceStatus::Completed);
    assert_eq!(good_report.state.results, vec![Value::from("still fine")]);

    let mut failed_events = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::InstanceFailed { instance_id, .. } = event {
            assert_eq!(instance_id, bad);
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn test_concurrent_instances_keep_their_own_state() {
    let orch = Arc::new(orchestrator(100));

    let mut ids = Vec::new();
    for n in 0..5 {
        let request = format!("request {}", n);
        let id = orch
            .create("echo", InstanceInput::new("p", request.clone()), delay(10 * n))
            .await
            .unwrap();
        ids.push((id, request));
    }

    for (id, request) in &ids {
        let report = orch.wait(*id).await.unwrap();
        assert_eq!(report.status, InstanceStatus::Completed);
        assert_eq!(report.state.results, vec![Value::from(request.as_str())]);
    }

    let listed = orch.list_instances().await;
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|s| s.status == InstanceStatus::Completed));
}

#[tokio::test]
async fn test_cancel_running_instance() {
    let orch = orchestrator(100);

    let id = orch
        .create("echo", InstanceInput::default(), delay(30_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(orch.cancel(id).await.unwrap());
    let report = tokio::time::timeout(Duration::from_secs(5), orch.wait(id))
        .await
        .expect("cancelled instance should finish")
        .unwrap();

    assert_eq!(report.status, InstanceStatus::Cancelled);
    assert!(!orch.cancel(id).await.unwrap());
    assert!(matches!(
        orch.cancel(Uuid::new_v4()).await,
        Err(OrchestratorError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_list_templates_sorted() {
    let orch = orchestrator(100);

    let ids: Vec<String> = orch
        .list_templates()
        .await
        .into_iter()
        .map(|t| t.id)
        .collect();

    assert_eq!(ids, vec!["broken", "cycle", "echo", "panics"]);
}
