//! InterruptNode: pauses the run until an external party answers

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::pregel::context::NodeContext;
use crate::pregel::interrupt::PauseInfo;
use crate::workflow::node::{InterruptSpec, Node, NodeInputs, NodeKind, NodeOutput};

type AutoResponder = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Surfaces its `prompt` input and waits for a `response` value.
///
/// When a fresh response is already in state the scheduler completes the
/// node without invoking it. Otherwise the optional auto-responder gets a
/// chance to answer; `None` pauses the run.
#[derive(Clone)]
pub struct InterruptNode {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    spec: InterruptSpec,
    responder: Option<AutoResponder>,
}

impl InterruptNode {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>, response: impl Into<String>) -> Self {
        let spec = InterruptSpec {
            prompt: prompt.into(),
            response: response.into(),
        };
        Self {
            name: name.into(),
            inputs: vec![spec.prompt.clone()],
            outputs: vec![spec.response.clone()],
            spec,
            responder: None,
        }
    }

    /// Answer prompts automatically when the closure returns `Some`
    pub fn with_responder<F, Fut>(mut self, responder: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.responder = Some(Arc::new(move |prompt: Value| responder(prompt).boxed()));
        self
    }
}

#[async_trait]
impl Node for InterruptNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Interrupt(self.spec.clone())
    }

    async fn invoke(&self, inputs: NodeInputs, _ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        let prompt = inputs.require(&self.spec.prompt)?.clone();

        if let Some(responder) = &self.responder {
            if let Some(answer) = responder(prompt.clone()).await? {
                return Ok(NodeOutput::value(self.spec.response.clone(), answer));
            }
        }

        Ok(NodeOutput::Pause(PauseInfo::new(
            self.name.clone(),
            prompt,
            self.spec.response.clone(),
        )))
    }
}

impl std::fmt::Debug for InterruptNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptNode")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("auto_response", &self.responder.is_some())
            .finish()
    }
}
