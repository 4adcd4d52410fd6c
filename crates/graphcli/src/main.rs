use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use graphcore::{Edge, ExecutionEvent, JoinPolicy, NodeKind, RetryPolicy, Value};
use graphruntime::{
    DefinitionLoader, DefinitionTemplate, GraphDefinition, HandlerSpec, InstanceInput,
    InstanceStatus, NodeDefinition, Orchestrator, RuntimeConfig, TemplateConfig,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphctl")]
#[command(about = "Graph task engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph definition as one instance
    Run {
        /// Path to graph definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// User request stored in the initial state
        #[arg(short, long, default_value = "")]
        request: String,

        /// Project id stored in the initial state
        #[arg(short, long, default_value = "default")]
        project: String,

        /// User context as a JSON object
        #[arg(short, long)]
        context: Option<String>,

        /// Maximum node visits before the run is aborted
        #[arg(long, default_value_t = graphruntime::DEFAULT_MAX_ITERATIONS)]
        max_iterations: usize,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a graph definition file
    Validate {
        /// Path to graph definition JSON file
        file: PathBuf,
    },

    /// List available handler types
    Handlers,

    /// List the graph definitions found in a directory
    Templates {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Create an example graph definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            request,
            project,
            context,
            max_iterations,
            verbose,
        } => {
            init_logging(if verbose { "debug" } else { "info" });
            let input = InstanceInput {
                project_id: project,
                user_request: request,
                context: parse_context(context)?,
            };
            run_graph(file, input, max_iterations).await?;
        }

        Commands::Validate { file } => {
            init_logging("warn");
            validate_graph(file)?;
        }

        Commands::Handlers => {
            list_handlers();
        }

        Commands::Templates { dir } => {
            init_logging("warn");
            list_templates(dir).await?;
        }

        Commands::Init { output } => {
            create_example_graph(output)?;
        }
    }

    Ok(())
}

fn parse_context(context: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(raw) = context else {
        return Ok(BTreeMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&raw).context("context is not valid JSON")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => bail!("Context must be a JSON object"),
    }
}

async fn run_graph(file: PathBuf, input: InstanceInput, max_iterations: usize) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());

    let definition = GraphDefinition::from_file(&file)
        .with_context(|| format!("failed to load {}", file.display()))?;

    println!("📋 Graph: {}", definition.name);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Edges: {}", definition.edges.len());
    println!();

    let handlers = Arc::new(graphnodes::standard_registry());
    let template_id = definition.template_id.clone();

    let orchestrator =
        Orchestrator::with_config(RuntimeConfig::default().with_max_iterations(max_iterations));
    orchestrator
        .register_template(Arc::new(DefinitionTemplate::new(definition, handlers)))
        .await;

    // Subscribe before the instance starts so no event is missed
    let mut events = orchestrator.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::InstanceStarted { instance_id, .. } => {
                    println!("▶️  Instance {} started", instance_id);
                }
                ExecutionEvent::NodeStarted {
                    node_id, iteration, ..
                } => {
                    println!("  ⚡ [{}] Starting node: {}", iteration, node_id);
                }
                ExecutionEvent::NodeCompleted {
                    node_id,
                    duration_ms,
                    attempts,
                    ..
                } => {
                    println!(
                        "  ✅ Node {} completed in {}ms ({} attempt(s))",
                        node_id, duration_ms, attempts
                    );
                }
                ExecutionEvent::NodeFailed {
                    node_id,
                    error,
                    attempts,
                    ..
                } => {
                    println!(
                        "  ❌ Node {} failed after {} attempt(s): {}",
                        node_id, attempts, error
                    );
                }
                ExecutionEvent::FanOut {
                    node_id, branches, ..
                } => {
                    println!("  🔀 {} fans out to {} branches", node_id, branches);
                }
                ExecutionEvent::BarrierReleased {
                    node_id,
                    arrived,
                    expected,
                    ..
                } => {
                    println!("  🔁 {} joined {}/{} branches", node_id, arrived, expected);
                }
                ExecutionEvent::BarrierSkipped {
                    node_id,
                    arrived,
                    expected,
                    ..
                } => {
                    println!(
                        "  ⚠️  {} skipped: {}/{} branches arrived",
                        node_id, arrived, expected
                    );
                }
                ExecutionEvent::InstanceFinished {
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("✨ Instance finished as {:?} in {}ms", status, duration_ms);
                    break;
                }
                ExecutionEvent::InstanceFailed { error, .. } => {
                    println!("💥 Instance failed: {}", error);
                    break;
                }
            }
        }
    });

    let instance_id = orchestrator
        .create(&template_id, input, TemplateConfig::new())
        .await?;
    let report = orchestrator.wait(instance_id).await?;

    // Let the listener print the final event
    if tokio::time::timeout(Duration::from_millis(500), event_task)
        .await
        .is_err()
    {
        tracing::debug!("Event listener did not finish in time");
    }

    let state = &report.state;
    println!();
    println!("📊 Execution Summary:");
    println!("   Instance ID: {}", report.instance_id);
    println!("   Status: {:?}", report.status);
    println!("   Node visits: {}", report.execution_log.len());
    println!("   Completed: {:?}", state.completed_tasks);
    if !state.failed_tasks.is_empty() {
        println!("   Failed: {:?}", state.failed_tasks);
    }
    if let Some(elapsed) = report.elapsed_ms {
        println!("   Elapsed: {}ms", elapsed);
    }

    if !state.agent_outputs.is_empty() {
        println!();
        println!("📤 Agent outputs:");
        for (agent, output) in &state.agent_outputs {
            println!("   {}: {}", agent, output.to_json());
        }
    }

    if !state.errors.is_empty() {
        println!();
        println!("🧯 Errors:");
        for error in &state.errors {
            println!("   [{}] {}", error.node, error.message);
        }
    }

    if let Some(error) = &report.error {
        bail!("instance {} failed: {}", report.instance_id, error);
    }
    if report.status == InstanceStatus::Aborted {
        bail!("instance {} exceeded the iteration cap", report.instance_id);
    }

    Ok(())
}

fn validate_graph(file: PathBuf) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let definition = GraphDefinition::from_file(&file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    let handlers = graphnodes::standard_registry();
    let graph = definition.validate(&handlers)?;

    println!("✅ Graph is valid:");
    println!("   Template: {} ({})", definition.template_id, definition.name);
    println!("   Nodes: {}", graph.node_count());
    println!("   Edges: {}", graph.edges().len());

    if let Some(entry) = graph.entry_point() {
        let unreachable = graph.unreachable_from(entry);
        if !unreachable.is_empty() {
            println!("   ⚠️  Unreachable from {}: {}", entry, unreachable.join(", "));
        }
    }

    Ok(())
}

fn list_handlers() {
    println!("📦 Available Handler Types:");
    println!();

    let registry = graphnodes::standard_registry();

    for handler_type in registry.list_handler_types() {
        if let Some(metadata) = registry.get_metadata(&handler_type) {
            println!("  • {} ({})", handler_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", handler_type);
        }
    }
}

async fn list_templates(dir: PathBuf) -> Result<()> {
    let handlers = Arc::new(graphnodes::standard_registry());
    let orchestrator = Orchestrator::new();
    for template in DefinitionLoader::new(&dir).load_templates(&handlers)? {
        orchestrator.register_template(template).await;
    }

    let templates = orchestrator.list_templates().await;
    if templates.is_empty() {
        println!("No graph definitions found in {}", dir.display());
        return Ok(());
    }

    println!("🗂️  Templates in {}:", dir.display());
    println!();
    for info in templates {
        println!("  • {} ({})", info.id, info.name);
        if !info.description.is_empty() {
            println!("    {}", info.description);
        }
    }
    Ok(())
}

fn node(id: &str, kind: NodeKind, handler_type: &str, config: &[(&str, Value)]) -> NodeDefinition {
    NodeDefinition {
        id: id.to_string(),
        name: None,
        kind,
        handler: HandlerSpec {
            handler_type: handler_type.to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        },
        retry: None,
        timeout_ms: None,
        route_field: None,
        join_policy: JoinPolicy::RequireAll,
        metadata: BTreeMap::new(),
    }
}

fn create_example_graph(output: PathBuf) -> Result<()> {
    let mut plan_fields = BTreeMap::new();
    plan_fields.insert(
        "tasks".to_string(),
        Value::from(vec![Value::from("research"), Value::from("review")]),
    );

    let mut research = node(
        "research",
        NodeKind::Task,
        "agent.echo",
        &[
            ("agent", Value::from("researcher")),
            ("prefix", Value::from("notes on: ")),
        ],
    );
    research.name = Some("Research".to_string());
    research.retry = Some(RetryPolicy::new(3, 200));

    let definition = GraphDefinition {
        template_id: "example".to_string(),
        name: "Example Fan-out Graph".to_string(),
        description: "Plans, runs two agents in parallel, joins and checks the results"
            .to_string(),
        entry_point: "plan".to_string(),
        nodes: vec![
            node(
                "plan",
                NodeKind::Task,
                "state.set",
                &[("fields", Value::Object(plan_fields))],
            ),
            node(
                "split",
                NodeKind::FanOut,
                "debug.log",
                &[("message", Value::from("splitting work"))],
            ),
            research,
            node(
                "review",
                NodeKind::Task,
                "agent.echo",
                &[
                    ("agent", Value::from("reviewer")),
                    ("prefix", Value::from("review of: ")),
                ],
            ),
            node(
                "join",
                NodeKind::FanIn,
                "quality.check",
                &[("min_items", Value::from(2))],
            ),
            node(
                "gate",
                NodeKind::Condition,
                "debug.log",
                &[("fields", Value::from(vec![Value::from("next_action")]))],
            ),
            node(
                "done",
                NodeKind::Task,
                "debug.log",
                &[("message", Value::from("all checks passed"))],
            ),
            node(
                "halt",
                NodeKind::Task,
                "control.stop",
                &[("next_action", Value::from("rework"))],
            ),
        ],
        edges: vec![
            Edge::new("plan", "split"),
            Edge::new("split", "research"),
            Edge::new("split", "review"),
            Edge::new("research", "join"),
            Edge::new("review", "join"),
            Edge::new("join", "gate"),
            Edge::labeled("gate", "done", "pass"),
            Edge::labeled("gate", "halt", "fail"),
        ],
    };

    std::fs::write(&output, definition.to_json_pretty()?)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  graphctl run --file {} --request 'summarize the design'",
        output.display()
    );

    Ok(())
}
