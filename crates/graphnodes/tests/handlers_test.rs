use graphcore::{NodeError, NodeHandler, Value, WorkflowState};
use graphnodes::{register_all, standard_registry, FailHandler};
use graphruntime::{
    DefinitionError, DefinitionTemplate, GraphDefinition, HandlerRegistry, InstanceInput,
    InstanceStatus, Orchestrator, TemplateConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;

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

fn config(json: serde_json::Value) -> BTreeMap<String, Value> {
    match Value::from(json) {
        Value::Object(map) => map,
        _ => BTreeMap::new(),
    }
}

fn state() -> Arc<WorkflowState> {
    Arc::new(WorkflowState::default().with_request("ship it"))
}

#[test]
fn test_register_all() {
    let mut registry = HandlerRegistry::new();
    register_all(&mut registry);

    assert_eq!(
        registry.list_handler_types(),
        vec![
            "agent.echo",
            "control.fail",
            "control.loop_guard",
            "control.stop",
            "debug.log",
            "quality.check",
            "state.set",
            "time.delay",
        ]
    );
    for handler_type in registry.list_handler_types() {
        let metadata = registry.get_metadata(&handler_type).unwrap();
        assert!(!metadata.description.is_empty());
    }
}

#[tokio::test]
async fn test_state_set() {
    let registry = standard_registry();
    let handler = registry
        .create_handler(
            "state.set",
            &config(serde_json::json!({ "fields": { "next_action": "review", "tasks": ["a"] } })),
        )
        .unwrap();

    let update = handler.handle(state()).await.unwrap();
    assert_eq!(update.get("next_action"), Some(&Value::from("review")));
    assert_eq!(update.get("tasks"), Some(&Value::from(vec![Value::from("a")])));

    let err = registry
        .create_handler("state.set", &BTreeMap::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        DefinitionError::Handler {
            source: NodeError::MissingField(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_delay() {
    let registry = standard_registry();
    let handler = registry
        .create_handler(
            "time.delay",
            &config(serde_json::json!({ "delay_ms": 20, "fields": { "results": "late" } })),
        )
        .unwrap();

    let started = std::time::Instant::now();
    let update = handler.handle(state()).await.unwrap();
    assert!(started.elapsed().as_millis() >= 20);
    assert_eq!(update.get("results"), Some(&Value::from("late")));

    assert!(registry
        .create_handler("time.delay", &config(serde_json::json!({ "delay_ms": -5 })))
        .is_err());
}

#[tokio::test]
async fn test_debug_log_changes_nothing() {
    init_tracing();
    let registry = standard_registry();
    let handler = registry
        .create_handler(
            "debug.log",
            &config(serde_json::json!({ "message": "hello", "fields": ["user_request"] })),
        )
        .unwrap();

    assert!(handler.handle(state()).await.unwrap().is_empty());
    assert!(registry
        .create_handler("debug.log", &config(serde_json::json!({ "fields": "oops" })))
        .is_err());
}

#[tokio::test]
async fn test_echo_agent() {
    let registry = standard_registry();
    let handler = registry
        .create_handler(
            "agent.echo",
            &config(serde_json::json!({ "agent": "writer", "prefix": "re: " })),
        )
        .unwrap();

    let update = handler.handle(state()).await.unwrap();
    let outputs = update.get("agent_outputs").and_then(Value::as_object).unwrap();
    assert_eq!(outputs.get("writer"), Some(&Value::from("re: ship it")));
    let result = update.get("results").and_then(Value::as_object).unwrap();
    assert_eq!(result.get("agent"), Some(&Value::from("writer")));

    assert!(registry.create_handler("agent.echo", &BTreeMap::new()).is_err());
}

#[tokio::test]
async fn test_stop() {
    let registry = standard_registry();
    let handler = registry
        .create_handler("control.stop", &config(serde_json::json!({ "next_action": "halt" })))
        .unwrap();

    let update = handler.handle(state()).await.unwrap();
    assert_eq!(update.get("should_continue"), Some(&Value::from(false)));
    assert_eq!(update.get("next_action"), Some(&Value::from("halt")));
}

#[tokio::test]
async fn test_fail_only_first_calls() {
    let handler = FailHandler::new("flaky", Some(2));

    assert!(handler.handle(state()).await.is_err());
    assert!(handler.handle(state()).await.is_err());
    assert!(handler.handle(state()).await.is_ok());
    assert_eq!(handler.calls(), 3);

    let always = FailHandler::new("always", None);
    let err = always.handle(state()).await.unwrap_err();
    assert!(err.to_string().contains("always"));
}

#[tokio::test]
async fn test_loop_guard_counts_passes() {
    let registry = standard_registry();
    let handler = registry
        .create_handler("control.loop_guard", &config(serde_json::json!({ "max": 2 })))
        .unwrap();

    let first = handler.handle(state()).await.unwrap();
    assert_eq!(first.get("loop_count").and_then(Value::as_i64), Some(1));
    assert_eq!(first.get("next_action"), Some(&Value::from("continue")));

    let mut seen = WorkflowState::default();
    seen.set_field("loop_count", Value::from(1)).unwrap();
    let second = handler.handle(Arc::new(seen)).await.unwrap();
    assert_eq!(second.get("loop_count").and_then(Value::as_i64), Some(2));
    assert_eq!(second.get("next_action"), Some(&Value::from("done")));

    assert!(registry
        .create_handler("control.loop_guard", &config(serde_json::json!({ "max": 0 })))
        .is_err());
}

#[tokio::test]
async fn test_quality_check() {
    let registry = standard_registry();
    let handler = registry
        .create_handler(
            "quality.check",
            &config(serde_json::json!({ "name": "coverage", "min_items": 1 })),
        )
        .unwrap();

    let failed = handler.handle(state()).await.unwrap();
    assert_eq!(failed.get("next_action"), Some(&Value::from("fail")));
    let record = failed.get("quality_checks").and_then(Value::as_object).unwrap();
    assert_eq!(record.get("check"), Some(&Value::from("coverage")));
    assert_eq!(record.get("passed"), Some(&Value::from(false)));

    let mut with_results = WorkflowState::default();
    with_results.results.push(Value::from("something"));
    let passed = handler.handle(Arc::new(with_results)).await.unwrap();
    assert_eq!(passed.get("next_action"), Some(&Value::from("pass")));
}

const REVIEW_GRAPH: &str = r#"{
    "template_id": "review",
    "name": "Review Loop",
    "entry_point": "plan",
    "nodes": [
        { "id": "plan", "handler": { "type": "state.set", "config": { "fields": { "tasks": ["draft", "critique"] } } } },
        { "id": "split", "kind": "fan_out", "handler": { "type": "debug.log" } },
        { "id": "writer", "handler": { "type": "agent.echo", "config": { "agent": "writer" } } },
        { "id": "critic", "handler": { "type": "agent.echo", "config": { "agent": "critic", "prefix": "critique of " } } },
        { "id": "join", "kind": "fan_in", "handler": { "type": "quality.check", "config": { "min_items": 2 } } },
        { "id": "gate", "kind": "condition", "handler": { "type": "control.loop_guard", "config": { "max": 2 } } },
        { "id": "finish", "handler": { "type": "control.stop" } }
    ],
    "edges": [
        { "from": "plan", "to": "split" },
        { "from": "split", "to": "writer" },
        { "from": "split", "to": "critic" },
        { "from": "writer", "to": "join" },
        { "from": "critic", "to": "join" },
        { "from": "join", "to": "gate" },
        { "from": "gate", "to": "split", "label": "continue" },
        { "from": "gate", "to": "finish", "label": "done" }
    ]
}"#;

#[tokio::test]
async fn test_review_loop_end_to_end() {
    init_tracing();

    let definition = GraphDefinition::from_json(REVIEW_GRAPH).unwrap();
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_template(Arc::new(DefinitionTemplate::new(
            definition,
            Arc::new(standard_registry()),
        )))
        .await;

    let id = orchestrator
        .create(
            "review",
            InstanceInput::new("docs", "the design doc"),
            TemplateConfig::new(),
        )
        .await
        .unwrap();
    let report = orchestrator.wait(id).await.unwrap();

    assert_eq!(report.status, InstanceStatus::Completed);
    let state = &report.state;
    assert!(!state.should_continue);
    assert!(state.errors.is_empty());
    assert_eq!(state.tasks.len(), 2);
    // Two passes through the fan-out, two agents each
    assert_eq!(state.results.len(), 4);
    assert_eq!(state.quality_checks.len(), 2);
    assert_eq!(
        state.agent_outputs.get("critic"),
        Some(&Value::from("critique of the design doc"))
    );
    assert_eq!(state.extension("loop_count").and_then(Value::as_i64), Some(2));
    assert_eq!(
        report.execution_log.last().map(|e| e.node_id.as_str()),
        Some("finish")
    );
}
