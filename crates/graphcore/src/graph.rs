use crate::{GraphError, InstanceId, Node, Value};
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Connection between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Selects this edge when `from` is a condition node
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn labeled(
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self::new(from, to).with_label(label)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every branch reached a terminal node, or `should_continue` went false
    Completed,
    /// The iteration cap was exceeded
    Aborted,
    /// Cancelled from outside
    Cancelled,
}

/// One node visit in the execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub iteration: usize,
    pub node_id: String,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Directed, possibly cyclic graph of nodes.
///
/// Mutating the graph clears the compiled flag; [`Graph::compile`] must run
/// again before execution.
#[derive(Debug, Clone)]
pub struct Graph {
    instance_id: InstanceId,
    template_id: String,
    nodes: HashMap<String, Node>,
    node_order: Vec<String>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
    adjacency: HashMap<String, Vec<Edge>>,
    compiled: bool,
}

impl Graph {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            template_id: template_id.into(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            entry_point: None,
            adjacency: HashMap::new(),
            compiled: false,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    /// Add a node; a node with the same id is replaced.
    pub fn add_node(&mut self, node: Node) -> &mut Self {
        if !self.nodes.contains_key(&node.id) {
            self.node_order.push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        self.compiled = false;
        self
    }

    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self.compiled = false;
        self
    }

    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.add_edge(Edge::new(from, to))
    }

    pub fn connect_labeled(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
    ) -> &mut Self {
        self.add_edge(Edge::labeled(from, to, label))
    }

    pub fn set_entry_point(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.entry_point = Some(node_id.into());
        self.compiled = false;
        self
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Outgoing edges in insertion order. Empty until compiled.
    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.adjacency
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn adjacency(&self) -> &HashMap<String, Vec<Edge>> {
        &self.adjacency
    }

    /// Validate the structure and build the adjacency map.
    ///
    /// Nothing is built if validation fails. Nodes unreachable from the entry
    /// point are allowed but logged.
    pub fn compile(&mut self) -> Result<(), GraphError> {
        self.compiled = false;
        self.adjacency.clear();

        let entry = self
            .entry_point
            .clone()
            .ok_or(GraphError::MissingEntryPoint)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownEntryPoint(entry));
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(GraphError::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.from.clone())
                .or_default()
                .push(edge.clone());
        }

        let unreachable = self.unreachable_from(&entry);
        if !unreachable.is_empty() {
            tracing::warn!(
                "Graph {} has nodes unreachable from '{}': {:?}",
                self.instance_id,
                entry,
                unreachable
            );
        }

        self.adjacency = adjacency;
        self.compiled = true;
        tracing::debug!(
            "Compiled graph {} ({} nodes, {} edges)",
            self.instance_id,
            self.nodes.len(),
            self.edges.len()
        );
        Ok(())
    }

    /// Node ids not reachable from `start`, in insertion order
    pub fn unreachable_from(&self, start: &str) -> Vec<String> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for id in &self.node_order {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for edge in &self.edges {
            let from = index.get(edge.from.as_str());
            let to = index.get(edge.to.as_str());
            if let (Some(&a), Some(&b)) = (from, to) {
                graph.add_edge(a, b, ());
            }
        }

        let Some(&root) = index.get(start) else {
            return self.node_order.clone();
        };
        let mut reached = HashSet::new();
        let mut bfs = Bfs::new(&graph, root);
        while let Some(nx) = bfs.next(&graph) {
            reached.insert(graph[nx]);
        }

        self.node_order
            .iter()
            .filter(|id| !reached.contains(id.as_str()))
            .cloned()
            .collect()
    }
}
