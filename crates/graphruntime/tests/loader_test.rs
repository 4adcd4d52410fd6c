use graphcore::{
    handler_fn, EventBus, GraphError, JoinPolicy, NodeError, NodeHandler, NodeKind, RunStatus,
    StateUpdate, Value, WorkflowState,
};
use graphruntime::{
    DefinitionError, DefinitionLoader, DefinitionTemplate, GraphDefinition, GraphExecutor,
    HandlerFactory, HandlerMetadata, HandlerRegistry, Template, TemplateConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Writes `config.value` into the `config.field` extension
struct WriteFactory;

impl HandlerFactory for WriteFactory {
    fn handler_type(&self) -> &str {
        "test.write"
    }

    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::MissingField("field".to_string()))?
            .to_string();
        let value = config.get("value").cloned().unwrap_or_default();
        Ok(handler_fn("test.write", move |_state| {
            let update = StateUpdate::new().with(field.clone(), value.clone());
            async move { Ok::<_, NodeError>(update) }
        }))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Write one field".to_string(),
            category: "test".to_string(),
        }
    }
}

fn handlers() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(WriteFactory));
    Arc::new(registry)
}

const DEFINITION: &str = r#"{
    "template_id": "router",
    "name": "Router Graph",
    "description": "Routes on a written field",
    "entry_point": "decide",
    "nodes": [
        {
            "id": "decide",
            "kind": "condition",
            "route_field": "verdict",
            "handler": { "type": "test.write", "config": { "field": "verdict", "value": "left" } }
        },
        {
            "id": "left",
            "name": "Left Side",
            "retry": { "max_attempts": 2, "delay_ms": 10 },
            "timeout_ms": 500,
            "handler": { "type": "test.write", "config": { "field": "side", "value": "L" } }
        },
        {
            "id": "right",
            "join_policy": "allow_partial",
            "handler": { "type": "test.write", "config": { "field": "side", "value": "R" } }
        }
    ],
    "edges": [
        { "from": "decide", "to": "left", "label": "left" },
        { "from": "decide", "to": "right", "label": "right" }
    ]
}"#;

#[test]
fn test_parse_definition() {
    let definition = GraphDefinition::from_json(DEFINITION).unwrap();

    assert_eq!(definition.template_id, "router");
    assert_eq!(definition.nodes.len(), 3);
    assert_eq!(definition.nodes[0].kind, NodeKind::Condition);
    assert_eq!(definition.nodes[1].kind, NodeKind::Task);
    assert_eq!(definition.nodes[1].retry.as_ref().map(|r| r.max_attempts), Some(2));
    assert_eq!(
        definition.nodes[1].retry.as_ref().map(|r| r.backoff_multiplier),
        Some(1.0)
    );
    assert_eq!(definition.nodes[2].join_policy, JoinPolicy::AllowPartial);
    assert_eq!(definition.edges[1].label.as_deref(), Some("right"));
}

#[test]
fn test_build_applies_node_settings() {
    let definition = GraphDefinition::from_json(DEFINITION).unwrap();
    let graph = definition.validate(&handlers()).unwrap();

    assert!(graph.is_compiled());
    let left = graph.node("left").unwrap();
    assert_eq!(left.name, "Left Side");
    assert_eq!(left.retry.max_attempts, 2);
    assert_eq!(left.timeout, Duration::from_millis(500));
    assert_eq!(left.handler_type(), "test.write");
    assert_eq!(graph.node("right").unwrap().name, "right");
}

#[tokio::test]
async fn test_definition_template_runs() {
    let definition = GraphDefinition::from_json(DEFINITION).unwrap();
    let template = DefinitionTemplate::new(definition, handlers());
    assert_eq!(template.template_id(), "router");
    assert_eq!(template.template_name(), "Router Graph");

    let mut graph = template.build_graph(&TemplateConfig::new()).unwrap();
    graph.compile().unwrap();

    let executor = GraphExecutor::new(50, Arc::new(EventBus::default()));
    let state = WorkflowState::new(graph.instance_id(), "router");
    let result = executor.run(&graph, state).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.state.extension("side"), Some(&Value::from("L")));
    assert_eq!(result.state.completed_tasks, vec!["decide", "left"]);
}

#[test]
fn test_unknown_handler_type() {
    let json = DEFINITION.replace(
        r#""type": "test.write", "config": { "field": "side", "value": "R" }"#,
        r#""type": "nope""#,
    );
    let definition = GraphDefinition::from_json(&json).unwrap();

    let err = definition.build(&handlers()).unwrap_err();
    assert!(matches!(err, DefinitionError::UnknownHandlerType(ref t) if t == "nope"));

    let template = DefinitionTemplate::new(definition, handlers());
    let err = template.build_graph(&TemplateConfig::new()).unwrap_err();
    assert!(matches!(err, GraphError::Invalid(_)));
}

#[test]
fn test_handler_config_error() {
    let json = DEFINITION.replace("{ \"field\": \"verdict\", \"value\": \"left\" }", "{}");
    let definition = GraphDefinition::from_json(&json).unwrap();

    let err = definition.build(&handlers()).unwrap_err();
    match err {
        DefinitionError::Handler {
            handler_type,
            source,
        } => {
            assert_eq!(handler_type, "test.write");
            assert!(matches!(source, NodeError::MissingField(ref f) if f == "field"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_structural_errors_surface_on_validate() {
    let json = DEFINITION.replace("\"to\": \"right\"", "\"to\": \"ghost\"");
    let definition = GraphDefinition::from_json(&json).unwrap();

    assert!(definition.build(&handlers()).is_ok());
    let err = definition.validate(&handlers()).unwrap_err();
    assert!(matches!(
        err,
        DefinitionError::Graph(GraphError::DanglingEdge { ref missing, .. }) if missing == "ghost"
    ));
}

#[test]
fn test_invalid_json() {
    let err = GraphDefinition::from_json("{ not json").unwrap_err();
    assert!(matches!(err, DefinitionError::Serialization(_)));
}

#[test]
fn test_loader_reads_json_files() {
    let dir = std::env::temp_dir().join(format!("graph-defs-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let second = DEFINITION.replace("\"template_id\": \"router\"", "\"template_id\": \"second\"");
    std::fs::write(dir.join("b.json"), second).unwrap();
    std::fs::write(dir.join("a.json"), DEFINITION).unwrap();
    std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

    let loader = DefinitionLoader::new(&dir);
    let definitions = loader.load_all().unwrap();
    let ids: Vec<&str> = definitions.iter().map(|d| d.template_id.as_str()).collect();
    assert_eq!(ids, vec!["router", "second"]);

    let templates = loader.load_templates(&handlers()).unwrap();
    assert_eq!(templates.len(), 2);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_definition_round_trips_through_json() {
    let definition = GraphDefinition::from_json(DEFINITION).unwrap();
    let json = definition.to_json_pretty().unwrap();
    assert_eq!(GraphDefinition::from_json(&json).unwrap(), definition);
}

#[test]
fn test_handler_registry_listing() {
    let registry = handlers();
    assert_eq!(registry.list_handler_types(), vec!["test.write".to_string()]);
    assert_eq!(
        registry.get_metadata("test.write").map(|m| m.category),
        Some("test".to_string())
    );
    assert!(registry.get_metadata("nope").is_none());
}
