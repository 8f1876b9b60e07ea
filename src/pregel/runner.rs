//! Runners
//!
//! A runner is an execution substrate for the scheduler. Each runner declares
//! which graph features it supports; a graph needing anything else is
//! rejected with `IncompatibleCapability` before a single node executes.
//!
//! - [`AsyncRunner`]: full capabilities, runs on the caller's tokio runtime
//! - [`SyncRunner`]: blocking entry point on a private current-thread
//!   runtime; cannot gather suspendable nodes

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::error::RunError;
use super::result::RunResult;
use super::runtime::{execute_graph, RunOptions, Scheduler};
use crate::workflow::graph::Graph;

/// Graph features a runner can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCapabilities {
    pub cycles: bool,
    pub gates: bool,
    pub interrupts: bool,
    pub suspendable: bool,
    pub nested: bool,
}

impl RunnerCapabilities {
    /// Everything supported
    pub fn full() -> Self {
        Self {
            cycles: true,
            gates: true,
            interrupts: true,
            suspendable: true,
            nested: true,
        }
    }

    /// Reject `graph` if it needs a feature this runner lacks
    pub fn check(&self, runner: &str, graph: &Graph) -> Result<(), RunError> {
        let required = [
            ("cycles", graph.has_cycles(), self.cycles),
            ("gates", graph.has_gates(), self.gates),
            ("interrupts", graph.has_interrupts(), self.interrupts),
            ("suspendable", graph.has_suspendable(), self.suspendable),
            ("nested", graph.has_nested(), self.nested),
        ];
        match required
            .iter()
            .find(|(_, needed, supported)| *needed && !*supported)
        {
            Some((capability, _, _)) => Err(RunError::incompatible(runner, *capability)),
            None => Ok(()),
        }
    }
}

fn rejected(graph: &Graph, options: &RunOptions, error: RunError) -> RunResult {
    warn!(graph = %graph.name(), error = %error, "Graph rejected by runner");
    RunResult::failed(
        uuid::Uuid::new_v4().to_string(),
        options.workflow_id.clone(),
        error,
    )
}

/// Runner for async callers
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncRunner;

impl AsyncRunner {
    pub const NAME: &'static str = "async";

    pub fn new() -> Self {
        Self
    }

    pub fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities::full()
    }

    /// Run `graph` once
    pub async fn run(
        &self,
        graph: &Graph,
        values: BTreeMap<String, Value>,
        options: RunOptions,
    ) -> RunResult {
        if let Err(error) = self.capabilities().check(Self::NAME, graph) {
            return rejected(graph, &options, error);
        }
        execute_graph(graph, values, &options).await
    }

    /// Run `graph` once per element of the list inputs named in `map_over`.
    ///
    /// The lists are zipped: item `i` receives element `i` of every mapped
    /// input plus every other value unchanged. All items run concurrently
    /// and share one permit pool. Durable items use the workflow id
    /// `"{parent}/{i}"`.
    pub async fn map(
        &self,
        graph: &Graph,
        values: BTreeMap<String, Value>,
        map_over: &[&str],
        options: RunOptions,
    ) -> Result<Vec<RunResult>, RunError> {
        self.capabilities().check(Self::NAME, graph)?;
        let items = zip_items(&values, map_over)?;
        info!(graph = %graph.name(), items = items.len(), "Mapping graph over inputs");

        let env = options.env();
        let runs = items.into_iter().enumerate().map(|(i, item)| {
            let workflow_id = options
                .workflow_id
                .as_ref()
                .map(|parent| format!("{}/{}", parent, i));
            Scheduler::new(graph, env.clone(), workflow_id, None, options.select.clone()).run(item)
        });
        let results = join_all(runs).await;

        env.emitter.flush(env.config.sink_flush_timeout).await;
        Ok(results)
    }
}

/// Split `values` into per-item input maps
fn zip_items(
    values: &BTreeMap<String, Value>,
    map_over: &[&str],
) -> Result<Vec<BTreeMap<String, Value>>, RunError> {
    let mut lists = Vec::with_capacity(map_over.len());
    for name in map_over {
        match values.get(*name) {
            Some(Value::Array(items)) => lists.push((*name, items)),
            Some(_) => {
                return Err(RunError::internal(format!(
                    "mapped input '{}' is not a list",
                    name
                )))
            }
            None => {
                return Err(RunError::internal(format!(
                    "mapped input '{}' not provided",
                    name
                )))
            }
        }
    }

    let Some(len) = lists.first().map(|(_, items)| items.len()) else {
        return Ok(vec![values.clone()]);
    };
    if let Some((name, items)) = lists.iter().find(|(_, items)| items.len() != len) {
        return Err(RunError::internal(format!(
            "mapped input '{}' has {} items, expected {}",
            name,
            items.len(),
            len
        )));
    }

    Ok((0..len)
        .map(|i| {
            let mut item = values.clone();
            for (name, items) in &lists {
                item.insert(name.to_string(), items[i].clone());
            }
            item
        })
        .collect())
}

/// Blocking runner
///
/// Drives the same scheduler on a private current-thread runtime, so it
/// must not be called from inside another tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRunner;

impl SyncRunner {
    pub const NAME: &'static str = "sync";

    pub fn new() -> Self {
        Self
    }

    pub fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities {
            suspendable: false,
            ..RunnerCapabilities::full()
        }
    }

    /// Run `graph` to completion, blocking the current thread
    pub fn run(
        &self,
        graph: &Graph,
        values: BTreeMap<String, Value>,
        options: RunOptions,
    ) -> RunResult {
        if let Err(error) = self.capabilities().check(Self::NAME, graph) {
            return rejected(graph, &options, error);
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let error = RunError::internal(format!("failed to start runtime: {}", e));
                return rejected(graph, &options, error);
            }
        };
        runtime.block_on(execute_graph(graph, values, &options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::NodeOutput;
    use crate::workflow::vertices::FunctionNode;
    use serde_json::json;

    fn double(suspendable: bool) -> Graph {
        let node = FunctionNode::new("double", &["x"], &["y"], |inputs| async move {
            let x: i64 = inputs.parse("x")?;
            Ok(NodeOutput::value("y", json!(x * 2)))
        });
        let node = if suspendable { node.suspendable() } else { node };
        Graph::builder().node(node).build().unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_capability_check() {
        let graph = double(true);
        assert!(RunnerCapabilities::full().check("async", &graph).is_ok());

        let err = SyncRunner::new()
            .capabilities()
            .check("sync", &graph)
            .unwrap_err();
        assert_eq!(
            err,
            RunError::IncompatibleCapability {
                runner: "sync".into(),
                capability: "suspendable".into()
            }
        );
    }

    #[test]
    fn test_sync_runner_runs_immediate_graph() {
        let result = SyncRunner::new().run(
            &double(false),
            values(&[("x", json!(21))]),
            RunOptions::new(),
        );
        assert!(result.is_completed());
        assert_eq!(result.get("y"), Some(&json!(42)));
    }

    #[test]
    fn test_sync_runner_rejects_suspendable_graph() {
        let result = SyncRunner::new().run(
            &double(true),
            values(&[("x", json!(1))]),
            RunOptions::new(),
        );
        assert!(result.is_failed());
        assert!(matches!(
            result.error,
            Some(RunError::IncompatibleCapability { .. })
        ));
        assert!(result.values.is_empty());
    }

    #[test]
    fn test_zip_items() {
        let input = values(&[("x", json!([1, 2, 3])), ("k", json!("shared"))]);
        let items = zip_items(&input, &["x"]).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["x"], json!(3));
        assert_eq!(items[0]["k"], json!("shared"));

        let ragged = values(&[("x", json!([1, 2])), ("y", json!([1]))]);
        assert!(zip_items(&ragged, &["x", "y"]).is_err());
        assert!(zip_items(&input, &["k"]).is_err());
    }

    #[tokio::test]
    async fn test_map_runs_every_item() {
        let results = AsyncRunner::new()
            .map(
                &double(true),
                values(&[("x", json!([1, 2, 3]))]),
                &["x"],
                RunOptions::new().with_max_concurrency(1),
            )
            .await
            .unwrap();

        let ys: Vec<_> = results.iter().map(|r| r.get("y").cloned()).collect();
        assert_eq!(ys, vec![Some(json!(2)), Some(json!(4)), Some(json!(6))]);
    }
}
