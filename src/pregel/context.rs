//! Explicit execution context
//!
//! Everything a node body may need from the run it belongs to (identity,
//! span ids, the shared permit pool, stop requests, nested execution) is
//! threaded through a [`NodeContext`] value rather than process-wide state,
//! so nested and concurrent runs never interfere.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::cache::NodeCache;
use super::checkpoint::SharedStepStore;
use super::concurrency::ConcurrencyController;
use super::config::RunConfig;
use super::events::{Event, EventEmitter, EventKind};
use super::result::{RunResult, Selection};
use super::runtime::Scheduler;
use crate::workflow::graph::Graph;

/// Cooperative stop request shared by every run of one call
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the run to stop. New candidates will not start; streaming nodes
    /// commit what they have.
    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Resources shared by a top-level run and everything nested inside it
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub config: RunConfig,
    pub concurrency: ConcurrencyController,
    pub emitter: EventEmitter,
    pub stop: StopSignal,
    pub store: Option<SharedStepStore>,
    pub cache: Option<Arc<dyn NodeCache>>,
}

/// Context handed to a node body
#[derive(Clone)]
pub struct NodeContext {
    pub(crate) env: RunEnv,
    pub(crate) run_id: String,
    pub(crate) workflow_id: Option<String>,
    pub(crate) node: String,
    pub(crate) span_id: String,
    pub(crate) run_span_id: String,
    pub(crate) superstep: usize,
}

impl NodeContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Workflow of the enclosing run, when durable
    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id.as_deref()
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Span of this node execution
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Span of the enclosing run
    pub fn parent_span_id(&self) -> &str {
        &self.run_span_id
    }

    pub fn superstep(&self) -> usize {
        self.superstep
    }

    pub fn is_stop_requested(&self) -> bool {
        self.env.stop.is_stopped()
    }

    /// Stop handle of the whole call
    pub fn stop_signal(&self) -> &StopSignal {
        &self.env.stop
    }

    /// Permit pool shared with every other run of this call
    pub fn concurrency(&self) -> &ConcurrencyController {
        &self.env.concurrency
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.env.emitter.emit(Event::new(
            self.run_id.clone(),
            self.span_id.clone(),
            Some(self.run_span_id.clone()),
            kind,
        ));
    }

    /// Run `graph` as a child of this node.
    ///
    /// The child shares the permit pool, event sinks and stop signal. In a
    /// durable run it persists under the workflow id `"{parent}/{node}"`.
    pub async fn run_graph(
        &self,
        graph: &Graph,
        values: BTreeMap<String, Value>,
        selection: Selection,
    ) -> RunResult {
        let workflow_id = match (&self.workflow_id, &self.env.store) {
            (Some(parent), Some(_)) => Some(format!("{}/{}", parent, self.node)),
            _ => None,
        };
        Scheduler::new(
            graph,
            self.env.clone(),
            workflow_id,
            Some(self.span_id.clone()),
            selection,
        )
        .run(values)
        .await
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("workflow_id", &self.workflow_id)
            .field("node", &self.node)
            .field("superstep", &self.superstep)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_signal_wakes_waiters() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!signal.is_stopped());
        signal.request_stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_when_already_requested() {
        let signal = StopSignal::new();
        signal.request_stop();
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .unwrap();
    }
}
