//! StreamNode: multi-value node whose elements are folded into one array
//!
//! Each element is emitted as a `StreamChunk` event as it arrives. A stop
//! request ends the fold early; what was collected is committed as a
//! partial output.

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;

use super::function::to_names;
use crate::pregel::context::NodeContext;
use crate::workflow::node::{Node, NodeCapabilities, NodeInputs, NodeOutput, ValueStream};

type StreamBody = Arc<dyn Fn(NodeInputs) -> anyhow::Result<ValueStream> + Send + Sync>;

#[derive(Clone)]
pub struct StreamNode {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    capabilities: NodeCapabilities,
    body: StreamBody,
}

impl StreamNode {
    /// Create a node producing the elements of `body(inputs)` under `output`
    pub fn new<F, S>(name: impl Into<String>, inputs: &[&str], output: impl Into<String>, body: F) -> Self
    where
        F: Fn(NodeInputs) -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            inputs: to_names(inputs),
            outputs: vec![output.into()],
            capabilities: NodeCapabilities {
                multi_value: true,
                ..NodeCapabilities::default()
            },
            body: Arc::new(move |inputs: NodeInputs| Ok(body(inputs)?.boxed())),
        }
    }

    /// Body awaits external work; run concurrently under the permit pool
    pub fn suspendable(mut self) -> Self {
        self.capabilities.suspendable = true;
        self
    }
}

#[async_trait]
impl Node for StreamNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.capabilities
    }

    async fn invoke(&self, inputs: NodeInputs, _ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        let stream = (self.body)(inputs)?;
        Ok(NodeOutput::Stream {
            output: self.outputs[0].clone(),
            stream,
        })
    }
}

impl std::fmt::Debug for StreamNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("output", &self.outputs[0])
            .finish()
    }
}
