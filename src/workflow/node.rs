//! Node contract consumed by the runtime
//!
//! A node is an immutable computation unit: it names the values it needs,
//! the values it may produce, and how the scheduler should treat it
//! (suspendable, multi-value, cacheable, persisted). Data flows only through
//! names; the runtime owns all mutation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::pregel::context::NodeContext;
use crate::pregel::interrupt::PauseInfo;
use crate::pregel::result::RunResult;
use crate::workflow::graph::{Graph, END};

/// Capability flags declared by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Body awaits external work; gathered concurrently under the permit pool
    pub suspendable: bool,
    /// Produces a lazy sequence folded into one value
    pub multi_value: bool,
    /// Outputs may be served from a node cache keyed by inputs
    pub cacheable: bool,
    /// Outputs are kept in Step Records
    pub persist: bool,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            suspendable: false,
            multi_value: false,
            cacheable: false,
            persist: true,
        }
    }
}

/// Routing targets declared by a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Node names or [`END`]
    pub targets: Vec<String>,
    /// Whether one decision may activate several targets
    pub multi_target: bool,
}

impl GateSpec {
    pub fn new(targets: Vec<String>, multi_target: bool) -> Self {
        Self {
            targets,
            multi_target,
        }
    }

    /// Whether `target` is part of the declared set
    pub fn declares(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }
}

/// Names used by a pause-capable node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptSpec {
    /// Value surfaced to the external party
    pub prompt: String,
    /// Name the response is written under
    pub response: String,
}

/// How the scheduler treats a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain node producing named values
    Function,
    /// Routing-only node
    Gate(GateSpec),
    /// Pause-capable node
    Interrupt(InterruptSpec),
    /// Container for a nested graph
    Graph,
}

impl NodeKind {
    pub fn is_gate(&self) -> bool {
        matches!(self, NodeKind::Gate(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, NodeKind::Interrupt(_))
    }

    pub fn is_graph(&self) -> bool {
        matches!(self, NodeKind::Graph)
    }

    /// Short label used in hashes and diagrams
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Function => "function",
            NodeKind::Gate(_) => "gate",
            NodeKind::Interrupt(_) => "interrupt",
            NodeKind::Graph => "graph",
        }
    }
}

/// Routing decision produced by a gate. Plain data, consumed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "targets", rename_all = "snake_case")]
pub enum RouteDecision {
    /// Activate these targets
    Targets(Vec<String>),
    /// Terminal sentinel: activate nothing
    End,
}

impl RouteDecision {
    /// Route to a single target (`END` maps to the terminal sentinel)
    pub fn to(target: impl Into<String>) -> Self {
        let target = target.into();
        if target == END {
            RouteDecision::End
        } else {
            RouteDecision::Targets(vec![target])
        }
    }

    /// Route to several targets
    pub fn to_many<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        RouteDecision::Targets(targets.into_iter().map(Into::into).collect())
    }

    /// Whether the decision names `target`
    pub fn activates(&self, target: &str) -> bool {
        match self {
            RouteDecision::Targets(targets) => targets.iter().any(|t| t == target),
            RouteDecision::End => false,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, RouteDecision::End)
    }

    /// Targets as labels, with the sentinel rendered as `END`
    pub fn labels(&self) -> Vec<String> {
        match self {
            RouteDecision::Targets(targets) => targets.clone(),
            RouteDecision::End => vec![END.to_string()],
        }
    }
}

/// Input values handed to a node body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    values: BTreeMap<String, Value>,
}

impl NodeInputs {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Value of `name`, if present
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Value of `name`, or an error naming the missing input
    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("input '{}' not provided", name))
    }

    /// Deserialize `name` into `T`
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.require(name)?.clone();
        serde_json::from_value(value)
            .map_err(|e| anyhow::anyhow!("input '{}' has unexpected shape: {}", name, e))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/// Lazy sequence produced by a multi-value node
pub type ValueStream = BoxStream<'static, anyhow::Result<Value>>;

/// What a node body returns
pub enum NodeOutput {
    /// Named output values
    Values(BTreeMap<String, Value>),
    /// Routing decision (gates only)
    Route(RouteDecision),
    /// Elements folded into one array stored under `output`
    Stream { output: String, stream: ValueStream },
    /// Halt the run and surface a value to an external party
    Pause(PauseInfo),
    /// Result of a nested graph run
    Nested(Box<RunResult>),
}

impl NodeOutput {
    /// Single named value
    pub fn value(name: impl Into<String>, value: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(name.into(), value);
        NodeOutput::Values(values)
    }

    /// Several named values
    pub fn values<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        NodeOutput::Values(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Nothing produced
    pub fn empty() -> Self {
        NodeOutput::Values(BTreeMap::new())
    }
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutput::Values(values) => f.debug_tuple("Values").field(values).finish(),
            NodeOutput::Route(decision) => f.debug_tuple("Route").field(decision).finish(),
            NodeOutput::Stream { output, .. } => {
                f.debug_struct("Stream").field("output", output).finish()
            }
            NodeOutput::Pause(info) => f.debug_tuple("Pause").field(info).finish(),
            NodeOutput::Nested(result) => f.debug_tuple("Nested").field(result).finish(),
        }
    }
}

/// The node contract
///
/// # Example
///
/// ```ignore
/// struct Double {
///     inputs: Vec<String>,
///     outputs: Vec<String>,
/// }
///
/// #[async_trait]
/// impl Node for Double {
///     fn name(&self) -> &str { "double" }
///     fn inputs(&self) -> &[String] { &self.inputs }
///     fn outputs(&self) -> &[String] { &self.outputs }
///
///     async fn invoke(&self, inputs: NodeInputs, _ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
///         let x: i64 = inputs.parse("x")?;
///         Ok(NodeOutput::value("doubled", json!(x * 2)))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique name within its graph
    fn name(&self) -> &str;

    /// Required input names, in declaration order
    fn inputs(&self) -> &[String];

    /// Names passed along when present. Never required, never part of staleness.
    fn optional_inputs(&self) -> &[String] {
        &[]
    }

    /// Names the node may produce
    fn outputs(&self) -> &[String];

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::default()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Function
    }

    /// The graph a container node runs
    fn nested_graph(&self) -> Option<&Graph> {
        None
    }

    /// Canonical description feeding the graph definition hash and cache keys
    fn signature(&self) -> String {
        let kind = serde_json::to_string(&self.kind()).unwrap_or_default();
        format!(
            "{}|{}|in={}|opt={}|out={}",
            self.name(),
            kind,
            self.inputs().join(","),
            self.optional_inputs().join(","),
            self.outputs().join(",")
        )
    }

    /// Execute the node body
    async fn invoke(&self, inputs: NodeInputs, ctx: &NodeContext) -> anyhow::Result<NodeOutput>;
}

/// Shared node handle
pub type BoxedNode = Arc<dyn Node>;
