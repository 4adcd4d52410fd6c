use crate::registry::{HandlerRegistry, Template, TemplateConfig};
use crate::DefinitionError;
use graphcore::{
    Edge, FieldRouter, Graph, GraphError, JoinPolicy, Node, NodeKind, RetryPolicy, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Handler reference inside a node definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    #[serde(rename = "type")]
    pub handler_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: NodeKind,
    pub handler: HandlerSpec,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// State field read by the router of a condition node
    #[serde(default)]
    pub route_field: Option<String>,
    #[serde(default)]
    pub join_policy: JoinPolicy,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_kind() -> NodeKind {
    NodeKind::Task
}

impl NodeDefinition {
    fn build(&self, handlers: &HandlerRegistry) -> Result<Node, DefinitionError> {
        let handler = handlers.create_handler(&self.handler.handler_type, &self.handler.config)?;

        let mut node = Node::new(self.id.clone(), self.kind, handler)
            .with_join_policy(self.join_policy);
        if let Some(name) = &self.name {
            node = node.with_name(name.clone());
        }
        if let Some(retry) = &self.retry {
            node = node.with_retry_policy(retry.clone());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            node = node.with_timeout(Duration::from_millis(timeout_ms));
        }
        if self.kind.is_branching() {
            let router = match &self.route_field {
                Some(field) => FieldRouter::new(field.clone()),
                None => FieldRouter::default(),
            };
            node = node.with_router(Arc::new(router));
        }
        for (key, value) in &self.metadata {
            node = node.with_metadata(key.clone(), value.clone());
        }
        Ok(node)
    }
}

/// Declarative graph, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub entry_point: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn to_json_pretty(&self) -> Result<String, DefinitionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build an uncompiled graph, resolving every handler through `handlers`.
    pub fn build(&self, handlers: &HandlerRegistry) -> Result<Graph, DefinitionError> {
        let mut graph = Graph::new(self.template_id.clone());
        for definition in &self.nodes {
            graph.add_node(definition.build(handlers)?);
        }
        for edge in &self.edges {
            graph.add_edge(edge.clone());
        }
        graph.set_entry_point(self.entry_point.clone());
        Ok(graph)
    }

    /// Build and compile, surfacing both handler and structural errors.
    pub fn validate(&self, handlers: &HandlerRegistry) -> Result<Graph, DefinitionError> {
        let mut graph = self.build(handlers)?;
        graph.compile()?;
        Ok(graph)
    }
}

/// Template backed by a [`GraphDefinition`]
pub struct DefinitionTemplate {
    definition: GraphDefinition,
    handlers: Arc<HandlerRegistry>,
}

impl DefinitionTemplate {
    pub fn new(definition: GraphDefinition, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            definition,
            handlers,
        }
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }
}

impl Template for DefinitionTemplate {
    fn template_id(&self) -> &str {
        &self.definition.template_id
    }

    fn template_name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn build_graph(&self, _config: &TemplateConfig) -> Result<Graph, GraphError> {
        self.definition.build(&self.handlers).map_err(|e| match e {
            DefinitionError::Graph(inner) => inner,
            other => GraphError::Invalid(other.to_string()),
        })
    }
}

/// Loads every `*.json` graph definition from a directory
pub struct DefinitionLoader {
    dir: PathBuf,
}

impl DefinitionLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Definitions sorted by file name
    pub fn load_all(&self) -> Result<Vec<GraphDefinition>, DefinitionError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            tracing::debug!("Loading graph definition {}", path.display());
            definitions.push(GraphDefinition::from_file(&path)?);
        }
        Ok(definitions)
    }

    /// Wrap each definition as a template
    pub fn load_templates(
        &self,
        handlers: &Arc<HandlerRegistry>,
    ) -> Result<Vec<Arc<dyn Template>>, DefinitionError> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|definition| {
                Arc::new(DefinitionTemplate::new(definition, Arc::clone(handlers)))
                    as Arc<dyn Template>
            })
            .collect())
    }
}
