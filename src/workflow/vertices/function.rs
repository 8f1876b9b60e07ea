//! FunctionNode: closure-backed computation node

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

use crate::pregel::context::NodeContext;
use crate::workflow::node::{Node, NodeCapabilities, NodeInputs, NodeOutput};

type FunctionBody =
    Arc<dyn Fn(NodeInputs, NodeContext) -> BoxFuture<'static, anyhow::Result<NodeOutput>> + Send + Sync>;

/// A node whose body is an async closure over its inputs
///
/// # Example
///
/// ```ignore
/// let embed = FunctionNode::new("embed", &["query"], &["vector"], |inputs| async move {
///     let query: String = inputs.parse("query")?;
///     Ok(NodeOutput::value("vector", json!(embed(&query))))
/// })
/// .cacheable();
/// ```
#[derive(Clone)]
pub struct FunctionNode {
    name: String,
    inputs: Vec<String>,
    optional_inputs: Vec<String>,
    outputs: Vec<String>,
    capabilities: NodeCapabilities,
    body: FunctionBody,
}

impl FunctionNode {
    /// Create a node from a closure over its inputs
    pub fn new<F, Fut>(name: impl Into<String>, inputs: &[&str], outputs: &[&str], body: F) -> Self
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
    {
        Self::with_context(name, inputs, outputs, move |inputs, _ctx| body(inputs))
    }

    /// Create a node whose closure also receives the execution context
    pub fn with_context<F, Fut>(
        name: impl Into<String>,
        inputs: &[&str],
        outputs: &[&str],
        body: F,
    ) -> Self
    where
        F: Fn(NodeInputs, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            inputs: to_names(inputs),
            optional_inputs: Vec::new(),
            outputs: to_names(outputs),
            capabilities: NodeCapabilities::default(),
            body: Arc::new(move |inputs: NodeInputs, ctx: NodeContext| body(inputs, ctx).boxed()),
        }
    }

    /// Also read these names when present
    pub fn optional(mut self, names: &[&str]) -> Self {
        self.optional_inputs = to_names(names);
        self
    }

    /// Body awaits external work; run concurrently under the permit pool
    pub fn suspendable(mut self) -> Self {
        self.capabilities.suspendable = true;
        self
    }

    /// Outputs may be served from the node cache
    pub fn cacheable(mut self) -> Self {
        self.capabilities.cacheable = true;
        self
    }

    /// Keep outputs out of step records; they are recomputed on resume
    pub fn no_persist(mut self) -> Self {
        self.capabilities.persist = false;
        self
    }
}

pub(crate) fn to_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[async_trait]
impl Node for FunctionNode {
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
        self.capabilities
    }

    async fn invoke(&self, inputs: NodeInputs, ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        (self.body)(inputs, ctx.clone()).await
    }
}

impl std::fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_flags() {
        let node = FunctionNode::new("embed", &["query"], &["vector"], |_| async {
            Ok(NodeOutput::empty())
        })
        .suspendable()
        .cacheable()
        .no_persist();

        let caps = node.capabilities();
        assert!(caps.suspendable);
        assert!(caps.cacheable);
        assert!(!caps.persist);
        assert_eq!(node.inputs(), ["query".to_string()]);
        assert_eq!(node.outputs(), ["vector".to_string()]);
    }

    #[test]
    fn test_signature_reflects_shape() {
        let a = FunctionNode::new("n", &["x"], &["y"], |_| async { Ok(NodeOutput::empty()) });
        let b = FunctionNode::new("n", &["x"], &["z"], |_| async { Ok(NodeOutput::empty()) });
        let c = a.clone().optional(&["hint"]);

        assert_ne!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
        assert!(a.signature().contains("\"type\":\"function\""));
    }
}
