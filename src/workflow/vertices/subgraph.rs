//! GraphNode: runs a nested graph as one node of its parent
//!
//! Inputs are the nested graph's external inputs; outputs are the names it
//! produces. Interrupt responses of the nested graph are optional inputs,
//! so a pause raised inside can be answered by supplying the response to
//! the parent. The container holds no concurrency permit itself; the
//! suspendable nodes inside take their own from the shared pool.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::pregel::context::NodeContext;
use crate::pregel::result::Selection;
use crate::workflow::graph::Graph;
use crate::workflow::node::{Node, NodeCapabilities, NodeInputs, NodeKind, NodeOutput};

#[derive(Debug, Clone)]
pub struct GraphNode {
    name: String,
    graph: Graph,
    inputs: Vec<String>,
    optional_inputs: Vec<String>,
    outputs: Vec<String>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, graph: Graph) -> Self {
        let inputs = graph.external_inputs().to_vec();
        let optional_inputs = graph
            .interrupt_responses()
            .iter()
            .filter(|r| !inputs.contains(r))
            .cloned()
            .collect();
        let outputs = graph
            .produced()
            .filter(|name| !graph.interrupt_responses().contains(name))
            .cloned()
            .collect();
        Self {
            name: name.into(),
            graph,
            inputs,
            optional_inputs,
            outputs,
        }
    }

    /// Only surface these nested names to the parent
    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.outputs.retain(|o| names.contains(&o.as_str()));
        self
    }
}

#[async_trait]
impl Node for GraphNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn optional_inputs(&self) -> &[String] {
        &self.optional_inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            suspendable: self.graph.has_suspendable(),
            ..NodeCapabilities::default()
        }
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Graph
    }

    fn nested_graph(&self) -> Option<&Graph> {
        Some(&self.graph)
    }

    async fn invoke(&self, inputs: NodeInputs, ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        let values: BTreeMap<_, _> = inputs.into_map();
        let result = ctx.run_graph(&self.graph, values, Selection::All).await;
        Ok(NodeOutput::Nested(Box::new(result)))
    }
}
