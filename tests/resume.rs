//! Integration tests for durable workflows
//!
//! These tests verify:
//! - Crash recovery: completed steps are not re-executed
//! - Re-running a finished workflow does no work
//! - Graph definition changes are detected on resume
//! - The file-backed store survives reopening
//! - Changed inputs re-run only their dependents

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use nodeflow::pregel::{
    create_store, FileStepStore, MemoryStepStore, SharedStepStore, StepStore, StoreConfig,
};
use nodeflow::prelude::*;
use nodeflow::{StepStatus, WorkflowStatus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Counts invocations of a node body
#[derive(Clone, Default)]
struct Calls(Arc<AtomicUsize>);

impl Calls {
    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// embed → generate, where generate fails while `failing` is set
fn flaky_graph(embeds: Calls, failing: Arc<AtomicBool>) -> Graph {
    Graph::builder()
        .name("flaky")
        .node(FunctionNode::new("embed", &["query"], &["vector"], move |_| {
            embeds.hit();
            async { Ok(NodeOutput::value("vector", json!([0.5, 0.5]))) }
        }))
        .node(FunctionNode::new("generate", &["vector"], &["answer"], move |_| {
            let fail = failing.load(Ordering::SeqCst);
            async move {
                if fail {
                    anyhow::bail!("model timed out");
                }
                Ok(NodeOutput::value("answer", json!("42")))
            }
        }))
        .build()
        .expect("Failed to build graph")
}

fn chain_graph(calls: Calls) -> Graph {
    let first = calls.clone();
    let second = calls;
    Graph::builder()
        .name("chain")
        .node(FunctionNode::new("a", &["x"], &["y"], move |inputs| {
            first.hit();
            async move {
                let x: i64 = inputs.parse("x")?;
                Ok(NodeOutput::value("y", json!(x + 1)))
            }
        }))
        .node(FunctionNode::new("b", &["y"], &["z"], move |inputs| {
            second.hit();
            async move {
                let y: i64 = inputs.parse("y")?;
                Ok(NodeOutput::value("z", json!(y * 10)))
            }
        }))
        .build()
        .expect("Failed to build graph")
}

fn durable(store: &SharedStepStore, workflow_id: &str) -> RunOptions {
    RunOptions::new()
        .with_workflow_id(workflow_id)
        .with_store(Arc::clone(store))
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_resume_after_failure_skips_completed_steps() {
    init_tracing();
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let embeds = Calls::default();
    let failing = Arc::new(AtomicBool::new(true));
    let graph = flaky_graph(embeds.clone(), failing.clone());
    let values = inputs(&[("query", json!("meaning of life"))]);

    let first = AsyncRunner::new()
        .run(&graph, values.clone(), durable(&store, "wf-crash"))
        .await;
    assert!(first.is_failed());
    assert_eq!(embeds.count(), 1);
    assert_eq!(
        store.load_workflow("wf-crash").await.unwrap().unwrap().status,
        WorkflowStatus::Failed
    );

    failing.store(false, Ordering::SeqCst);
    let second = AsyncRunner::new()
        .run(&graph, values, durable(&store, "wf-crash"))
        .await;

    assert!(second.is_completed(), "resume failed: {:?}", second.error);
    assert_eq!(second.get("answer"), Some(&json!("42")));
    assert_eq!(second.supersteps, 1);
    assert_eq!(embeds.count(), 1, "embed must not run again");

    // the failed attempt is retried under its original position
    let steps = store.load_steps("wf-crash").await.unwrap();
    let generate: Vec<_> = steps
        .iter()
        .filter(|s| s.node == "generate")
        .map(|s| (s.position(), s.status))
        .collect();
    assert_eq!(generate, vec![((1, 0), StepStatus::Completed)]);
    assert_eq!(
        store.load_workflow("wf-crash").await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

/// a, b, c fan out from x; d joins a and c. c fails while `failing` is set.
fn fan_graph(calls: &[Calls; 3], failing: Arc<AtomicBool>) -> Graph {
    let mut builder = Graph::builder().name("fan");
    for (name, counter) in ["a", "b", "c"].into_iter().zip(calls.iter().cloned()) {
        let output: &'static str = match name {
            "a" => "a_out",
            "b" => "b_out",
            _ => "c_out",
        };
        let failing = failing.clone();
        builder = builder.node(FunctionNode::new(name, &["x"], &[output], move |inputs| {
            counter.hit();
            let fail = output == "c_out" && failing.load(Ordering::SeqCst);
            async move {
                if fail {
                    anyhow::bail!("worker lost");
                }
                let x: i64 = inputs.parse("x")?;
                Ok(NodeOutput::value(output, json!(x * 2)))
            }
        }));
    }
    builder
        .node(FunctionNode::new("d", &["a_out", "c_out"], &["joined"], |inputs| async move {
            let a: i64 = inputs.parse("a_out")?;
            let c: i64 = inputs.parse("c_out")?;
            Ok(NodeOutput::value("joined", json!(a + c)))
        }))
        .build()
        .expect("Failed to build graph")
}

fn positions(steps: &[nodeflow::StepRecord]) -> Vec<(String, usize, usize, StepStatus)> {
    steps
        .iter()
        .map(|s| (s.node.clone(), s.superstep, s.index, s.status))
        .collect()
}

#[tokio::test]
async fn test_partial_superstep_reruns_only_uncommitted_node() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let calls = [Calls::default(), Calls::default(), Calls::default()];
    let failing = Arc::new(AtomicBool::new(true));
    let graph = fan_graph(&calls, failing.clone());
    let values = inputs(&[("x", json!(21))]);

    let first = AsyncRunner::new()
        .run(&graph, values.clone(), durable(&store, "wf-fan"))
        .await;
    assert!(first.is_failed());

    failing.store(false, Ordering::SeqCst);
    let second = AsyncRunner::new()
        .run(&graph, values.clone(), durable(&store, "wf-fan"))
        .await;

    assert!(second.is_completed(), "resume failed: {:?}", second.error);
    let counts: Vec<_> = calls.iter().map(Calls::count).collect();
    assert_eq!(counts, vec![1, 1, 2]);
    assert_eq!(second.get("joined"), Some(&json!(84)));

    // positions match a run that never failed
    let clean: SharedStepStore = Arc::new(MemoryStepStore::new());
    let uninterrupted = AsyncRunner::new()
        .run(
            &fan_graph(&Default::default(), Arc::new(AtomicBool::new(false))),
            values,
            durable(&clean, "wf-fan"),
        )
        .await;
    assert!(uninterrupted.is_completed());

    let resumed = positions(&store.load_steps("wf-fan").await.unwrap());
    assert_eq!(resumed, positions(&clean.load_steps("wf-fan").await.unwrap()));
    assert_eq!(
        resumed,
        vec![
            ("a".to_string(), 0, 0, StepStatus::Completed),
            ("b".to_string(), 0, 1, StepStatus::Completed),
            ("c".to_string(), 0, 2, StepStatus::Completed),
            ("d".to_string(), 1, 0, StepStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn test_rerun_of_completed_workflow_is_a_no_op() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let calls = Calls::default();
    let graph = chain_graph(calls.clone());
    let values = inputs(&[("x", json!(1))]);

    let first = AsyncRunner::new()
        .run(&graph, values.clone(), durable(&store, "wf-idem"))
        .await;
    assert_eq!(first.get("z"), Some(&json!(20)));
    assert_eq!(calls.count(), 2);

    let again = AsyncRunner::new()
        .run(&graph, values, durable(&store, "wf-idem"))
        .await;

    assert!(again.is_completed());
    assert_eq!(again.supersteps, 0);
    assert_eq!(again.get("z"), Some(&json!(20)));
    assert_eq!(calls.count(), 2);
    assert_eq!(store.load_steps("wf-idem").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_changed_input_reruns_only_dependents() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let (left, right) = (Calls::default(), Calls::default());
    let (l, r) = (left.clone(), right.clone());
    let graph = Graph::builder()
        .node(FunctionNode::new("left", &["a"], &["a_out"], move |inputs| {
            l.hit();
            async move { Ok(NodeOutput::value("a_out", inputs.require("a")?.clone())) }
        }))
        .node(FunctionNode::new("right", &["b"], &["b_out"], move |inputs| {
            r.hit();
            async move { Ok(NodeOutput::value("b_out", inputs.require("b")?.clone())) }
        }))
        .build()
        .unwrap();

    AsyncRunner::new()
        .run(
            &graph,
            inputs(&[("a", json!(1)), ("b", json!(1))]),
            durable(&store, "wf-partial"),
        )
        .await
        .into_result()
        .expect("first run failed");

    let second = AsyncRunner::new()
        .run(
            &graph,
            inputs(&[("a", json!(2)), ("b", json!(1))]),
            durable(&store, "wf-partial"),
        )
        .await;

    assert!(second.is_completed());
    assert_eq!(second.supersteps, 1);
    assert_eq!(second.get("a_out"), Some(&json!(2)));
    assert_eq!((left.count(), right.count()), (2, 1));

    let steps = store.load_steps("wf-partial").await.unwrap();
    let last = steps.last().unwrap();
    assert_eq!((last.node.as_str(), last.superstep), ("left", 1));
    assert_eq!(last.input_versions["a"], 2);
}

// =============================================================================
// Graph definition changes
// =============================================================================

#[tokio::test]
async fn test_changed_graph_requires_force_resume() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let values = inputs(&[("x", json!(1))]);

    AsyncRunner::new()
        .run(&chain_graph(Calls::default()), values.clone(), durable(&store, "wf-hash"))
        .await
        .into_result()
        .expect("first run failed");

    let changed = Graph::builder()
        .node(FunctionNode::new("a", &["x"], &["y"], |_| async {
            Ok(NodeOutput::value("y", json!(0)))
        }))
        .build()
        .unwrap();

    let rejected = AsyncRunner::new()
        .run(&changed, values.clone(), durable(&store, "wf-hash"))
        .await;
    match &rejected.error {
        Some(RunError::VersionMismatch {
            workflow_id,
            expected,
            found,
        }) => {
            assert_eq!(workflow_id, "wf-hash");
            assert_eq!(found, changed.hash());
            assert_ne!(expected, found);
        }
        other => panic!("expected VersionMismatch, got {:?}", other),
    }

    let forced = AsyncRunner::new()
        .run(
            &changed,
            values,
            durable(&store, "wf-hash").with_force_resume(true),
        )
        .await;
    assert!(forced.is_completed(), "forced resume failed: {:?}", forced.error);

    let workflow = store.load_workflow("wf-hash").await.unwrap().unwrap();
    assert_eq!(workflow.graph_hash, changed.hash());
}

// =============================================================================
// File store
// =============================================================================

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let graph = chain_graph(calls.clone());
    let values = inputs(&[("x", json!(4))]);

    {
        let store = create_store(StoreConfig::File {
            path: temp_dir.path().to_path_buf(),
            compression: true,
        });
        let result = AsyncRunner::new()
            .run(&graph, values.clone(), durable(&store, "wf-file"))
            .await;
        assert_eq!(result.get("z"), Some(&json!(50)));
    }

    let reopened: SharedStepStore = Arc::new(FileStepStore::new(temp_dir.path(), true));
    assert_eq!(
        reopened.list_workflows().await.unwrap(),
        vec!["wf-file".to_string()]
    );
    assert_eq!(reopened.load_steps("wf-file").await.unwrap().len(), 2);

    let result = AsyncRunner::new()
        .run(&graph, values, durable(&reopened, "wf-file"))
        .await;
    assert!(result.is_completed());
    assert_eq!(result.supersteps, 0);
    assert_eq!(result.get("z"), Some(&json!(50)));
    assert_eq!(calls.count(), 2);

    reopened.delete_workflow("wf-file").await.unwrap();
    assert!(reopened.load_workflow("wf-file").await.unwrap().is_none());
}
