//! Graph builder.
//!
//! Nodes are wired implicitly: an edge exists wherever one node's output
//! name equals another node's input name. Gates add control edges to their
//! declared targets. Everything the runtime needs to know about the graph
//! (cycles, gates, interrupts, leaf outputs, definition hash) is computed
//! once here and trusted afterwards.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::pregel::routing::RoutingTable;
use crate::pregel::step::StepRecord;
use crate::pregel::visualization::{render_edge, render_node, render_node_with_status, STYLE_DEFS};
use crate::workflow::node::{BoxedNode, Node, NodeCapabilities, NodeKind};

/// Sentinel target for terminal routing decisions.
pub const END: &str = "END";

/// Errors that can occur while building a graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("'{0}' is reserved")]
    ReservedName(String),
    #[error("gate '{0}' declares no targets")]
    EmptyGate(String),
    #[error("gate '{gate}' targets unknown node '{target}'")]
    UnknownTarget { gate: String, target: String },
    #[error("interrupt node '{node}' is malformed: {reason}")]
    InvalidInterrupt { node: String, reason: String },
    #[error("container node '{0}' shares its name with a value")]
    NameCollision(String),
}

/// Node plus build-time facts about it
#[derive(Clone)]
pub struct GraphEntry {
    pub node: BoxedNode,
    pub kind: NodeKind,
    pub capabilities: NodeCapabilities,
}

impl GraphEntry {
    pub fn name(&self) -> &str {
        self.node.name()
    }
}

/// Inferred edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Value name for data edges, `None` for gate edges
    pub label: Option<String>,
}

impl Edge {
    pub fn is_control(&self) -> bool {
        self.label.is_none()
    }
}

/// Fluent builder for [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<BoxedNode>,
}

impl GraphBuilder {
    /// Create a new graph builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the graph name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a node.
    pub fn node(self, node: impl Node + 'static) -> Self {
        self.shared_node(Arc::new(node))
    }

    /// Add an already shared node.
    pub fn shared_node(mut self, node: BoxedNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Validate and build the graph.
    pub fn build(self) -> Result<Graph, GraphError> {
        let mut nodes: BTreeMap<String, GraphEntry> = BTreeMap::new();
        for node in self.nodes {
            let name = node.name().to_string();
            if name == END {
                return Err(GraphError::ReservedName(name));
            }
            if nodes.contains_key(&name) {
                return Err(GraphError::DuplicateNode(name));
            }
            let entry = GraphEntry {
                kind: node.kind(),
                capabilities: node.capabilities(),
                node,
            };
            nodes.insert(name, entry);
        }

        let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut consumers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, entry) in &nodes {
            for output in entry.node.outputs() {
                producers.entry(output.clone()).or_default().push(name.clone());
            }
            for input in entry.node.inputs().iter().chain(entry.node.optional_inputs()) {
                consumers.entry(input.clone()).or_default().push(name.clone());
            }
        }

        for (name, entry) in &nodes {
            match &entry.kind {
                NodeKind::Gate(spec) => {
                    if spec.targets.is_empty() {
                        return Err(GraphError::EmptyGate(name.clone()));
                    }
                    if let Some(target) = spec
                        .targets
                        .iter()
                        .find(|t| t.as_str() != END && !nodes.contains_key(*t))
                    {
                        return Err(GraphError::UnknownTarget {
                            gate: name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                NodeKind::Interrupt(spec) => {
                    if !entry.node.inputs().contains(&spec.prompt) {
                        return Err(GraphError::InvalidInterrupt {
                            node: name.clone(),
                            reason: format!("prompt '{}' is not an input", spec.prompt),
                        });
                    }
                    if !entry.node.outputs().contains(&spec.response) {
                        return Err(GraphError::InvalidInterrupt {
                            node: name.clone(),
                            reason: format!("response '{}' is not an output", spec.response),
                        });
                    }
                }
                NodeKind::Graph => {
                    if producers.contains_key(name) || consumers.contains_key(name) {
                        return Err(GraphError::NameCollision(name.clone()));
                    }
                }
                NodeKind::Function => {}
            }
        }

        let mut edges = BTreeSet::new();
        for (value, from_nodes) in &producers {
            for to in consumers.get(value).into_iter().flatten() {
                for from in from_nodes {
                    edges.insert(Edge {
                        from: from.clone(),
                        to: to.clone(),
                        label: Some(value.clone()),
                    });
                }
            }
        }
        for (name, entry) in &nodes {
            if let NodeKind::Gate(spec) = &entry.kind {
                for target in spec.targets.iter().filter(|t| t.as_str() != END) {
                    edges.insert(Edge {
                        from: name.clone(),
                        to: target.clone(),
                        label: None,
                    });
                }
            }
        }
        let edges: Vec<Edge> = edges.into_iter().collect();

        let leaf_outputs = producers
            .keys()
            .filter(|v| !consumers.contains_key(*v))
            .cloned()
            .collect();

        let external_inputs: Vec<String> = nodes
            .values()
            .flat_map(|e| e.node.inputs().iter())
            .filter(|i| !producers.contains_key(*i))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut interrupt_responses = BTreeSet::new();
        for entry in nodes.values() {
            match &entry.kind {
                NodeKind::Interrupt(spec) => {
                    interrupt_responses.insert(spec.response.clone());
                }
                NodeKind::Graph => {
                    if let Some(nested) = entry.node.nested_graph() {
                        interrupt_responses.extend(nested.interrupt_responses().iter().cloned());
                    }
                }
                _ => {}
            }
        }

        let routing = RoutingTable::new(nodes.iter().filter_map(|(name, entry)| match &entry.kind {
            NodeKind::Gate(spec) => Some((name.as_str(), spec)),
            _ => None,
        }));

        let has_cycles = detect_cycles(&nodes, &edges);
        let has_gates = nodes.values().any(|e| e.kind.is_gate())
            || nested_any(&nodes, |g| g.has_gates());
        let has_interrupts = nodes.values().any(|e| e.kind.is_interrupt())
            || nested_any(&nodes, |g| g.has_interrupts());
        let has_suspendable = nodes.values().any(|e| e.capabilities.suspendable)
            || nested_any(&nodes, |g| g.has_suspendable());
        let has_nested = nodes.values().any(|e| e.kind.is_graph());

        let hash = definition_hash(&nodes);

        Ok(Graph {
            inner: Arc::new(GraphInner {
                name: self.name,
                nodes,
                edges,
                producers,
                routing,
                has_cycles,
                has_gates,
                has_interrupts,
                has_suspendable,
                has_nested,
                leaf_outputs,
                external_inputs,
                interrupt_responses: interrupt_responses.into_iter().collect(),
                hash,
            }),
        })
    }
}

fn nested_any(nodes: &BTreeMap<String, GraphEntry>, check: impl Fn(&Graph) -> bool) -> bool {
    nodes
        .values()
        .filter_map(|e| e.node.nested_graph())
        .any(check)
}

/// Depth-first colouring over data and gate edges
fn detect_cycles(nodes: &BTreeMap<String, GraphEntry>, edges: &[Edge]) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut colour: BTreeMap<&str, Colour> =
        nodes.keys().map(|n| (n.as_str(), Colour::White)).collect();

    fn visit<'a>(
        node: &'a str,
        adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
        colour: &mut BTreeMap<&'a str, Colour>,
    ) -> bool {
        colour.insert(node, Colour::Grey);
        for next in adjacency.get(node).into_iter().flatten() {
            match colour.get(next).copied().unwrap_or(Colour::White) {
                Colour::Grey => return true,
                Colour::White => {
                    if visit(next, adjacency, colour) {
                        return true;
                    }
                }
                Colour::Black => {}
            }
        }
        colour.insert(node, Colour::Black);
        false
    }

    let names: Vec<&str> = nodes.keys().map(String::as_str).collect();
    names.into_iter().any(|name| {
        colour.get(name).copied() == Some(Colour::White) && visit(name, &adjacency, &mut colour)
    })
}

/// Hex SHA-256 over the sorted node signatures (nested graphs included)
fn definition_hash(nodes: &BTreeMap<String, GraphEntry>) -> String {
    let mut hasher = Sha256::new();
    for entry in nodes.values() {
        hasher.update(entry.node.signature().as_bytes());
        if let Some(nested) = entry.node.nested_graph() {
            hasher.update(b"|nested=");
            hasher.update(nested.hash().as_bytes());
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

struct GraphInner {
    name: String,
    nodes: BTreeMap<String, GraphEntry>,
    edges: Vec<Edge>,
    producers: BTreeMap<String, Vec<String>>,
    routing: RoutingTable,
    has_cycles: bool,
    has_gates: bool,
    has_interrupts: bool,
    has_suspendable: bool,
    has_nested: bool,
    leaf_outputs: Vec<String>,
    external_inputs: Vec<String>,
    interrupt_responses: Vec<String>,
    hash: String,
}

/// Immutable, validated graph. Cloning is cheap.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Start building a graph
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Nodes in name order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphEntry> {
        self.inner.nodes.values()
    }

    pub fn node(&self, name: &str) -> Option<&GraphEntry> {
        self.inner.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.inner.edges
    }

    /// Nodes declaring `value` as an output
    pub fn producers_of(&self, value: &str) -> &[String] {
        self.inner
            .producers
            .get(value)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_produced(&self, value: &str) -> bool {
        self.inner.producers.contains_key(value)
    }

    /// Every name some node declares as an output, sorted
    pub fn produced(&self) -> impl Iterator<Item = &String> {
        self.inner.producers.keys()
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn has_cycles(&self) -> bool {
        self.inner.has_cycles
    }

    pub fn has_gates(&self) -> bool {
        self.inner.has_gates
    }

    pub fn has_interrupts(&self) -> bool {
        self.inner.has_interrupts
    }

    /// Whether any node, at any nesting depth, is suspendable
    pub fn has_suspendable(&self) -> bool {
        self.inner.has_suspendable
    }

    pub fn has_nested(&self) -> bool {
        self.inner.has_nested
    }

    /// Output names with no downstream consumer
    pub fn leaf_outputs(&self) -> &[String] {
        &self.inner.leaf_outputs
    }

    /// Required inputs no node produces
    pub fn external_inputs(&self) -> &[String] {
        &self.inner.external_inputs
    }

    /// Response names of interrupt nodes, nested graphs included
    pub fn interrupt_responses(&self) -> &[String] {
        &self.inner.interrupt_responses
    }

    /// Definition hash used to detect unsafe resumes
    pub fn hash(&self) -> &str {
        &self.inner.hash
    }

    /// Render the graph as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        self.render_mermaid(|_| None)
    }

    /// Render the graph with each node styled by its latest step status.
    pub fn to_mermaid_with_steps(&self, steps: &[StepRecord]) -> String {
        self.render_mermaid(|name| {
            steps
                .iter()
                .filter(|s| s.node == name)
                .max_by_key(|s| s.position())
                .map(|s| s.status)
        })
    }

    fn render_mermaid(
        &self,
        status_of: impl Fn(&str) -> Option<crate::pregel::step::StepStatus>,
    ) -> String {
        let mut lines = vec!["flowchart TD".to_string()];
        for entry in self.nodes() {
            lines.push(render_node_with_status(
                entry.name(),
                Some(&entry.kind),
                status_of(entry.name()),
            ));
        }

        let ends = self
            .nodes()
            .any(|e| matches!(&e.kind, NodeKind::Gate(spec) if spec.declares(END)));
        if ends {
            lines.push(render_node(END, None));
        }

        for edge in self.edges() {
            lines.push(render_edge(
                &edge.from,
                &edge.to,
                edge.label.as_deref(),
                edge.is_control(),
            ));
        }
        for entry in self.nodes() {
            if let NodeKind::Gate(spec) = &entry.kind {
                if spec.declares(END) {
                    lines.push(render_edge(entry.name(), END, None, true));
                }
            }
        }

        let mut out = lines.join("\n");
        out.push_str(STYLE_DEFS);
        out
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.inner.name)
            .field("nodes", &self.inner.nodes.keys().collect::<Vec<_>>())
            .field("has_cycles", &self.inner.has_cycles)
            .field("hash", &self.inner.hash)
            .finish()
    }
}
