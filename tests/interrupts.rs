//! Integration tests for human-in-the-loop pauses
//!
//! These tests verify:
//! - A pause surfaces the prompt and resumes in place once answered
//! - Resuming without the response pauses again without duplicating records
//! - Auto-responders answer without pausing
//! - A pause inside a loop accepts the same answer on every pass
//! - Pauses inside nested graphs propagate with their full path

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nodeflow::pregel::{MemoryStepStore, SharedStepStore, StepStore};
use nodeflow::prelude::*;
use nodeflow::{StepStatus, WorkflowStatus};

fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn draft() -> FunctionNode {
    FunctionNode::new("draft", &["topic"], &["text"], |inputs| async move {
        let topic: String = inputs.parse("topic")?;
        Ok(NodeOutput::value("text", json!(format!("Post about {}", topic))))
    })
}

fn publish() -> FunctionNode {
    FunctionNode::new("publish", &["text", "approval"], &["published"], |inputs| async move {
        let approval: String = inputs.parse("approval")?;
        let text: String = inputs.parse("text")?;
        Ok(NodeOutput::value("published", json!(format!("{} [{}]", text, approval))))
    })
}

/// draft → approve (pause) → publish
fn approval_graph() -> Graph {
    Graph::builder()
        .name("approval")
        .node(draft())
        .node(InterruptNode::new("approve", "text", "approval"))
        .node(publish())
        .build()
        .expect("Failed to build graph")
}

fn durable(store: &SharedStepStore, workflow_id: &str) -> RunOptions {
    RunOptions::new()
        .with_workflow_id(workflow_id)
        .with_store(Arc::clone(store))
}

// =============================================================================
// Pause and resume
// =============================================================================

#[tokio::test]
async fn test_pause_then_resume_updates_record_in_place() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let graph = approval_graph();
    assert!(graph.has_interrupts());

    let paused = AsyncRunner::new()
        .run(
            &graph,
            inputs(&[("topic", json!("rust"))]),
            durable(&store, "wf-approve"),
        )
        .await;

    assert!(paused.is_paused(), "expected pause, got {:?}", paused.status);
    let pause = paused.pause.as_ref().expect("pause info");
    assert_eq!(pause.node, "approve");
    assert_eq!(pause.path, "approve");
    assert_eq!(pause.response_key, "approval");
    assert_eq!(pause.value, json!("Post about rust"));
    assert!(paused.get("published").is_none());
    assert_eq!(
        store.load_workflow("wf-approve").await.unwrap().unwrap().status,
        WorkflowStatus::Active
    );

    let steps = store.load_steps("wf-approve").await.unwrap();
    let approve = steps.iter().find(|s| s.node == "approve").unwrap();
    assert_eq!(approve.status, StepStatus::Paused);
    assert_eq!(approve.position(), (1, 0));

    let resumed = AsyncRunner::new()
        .run(
            &graph,
            inputs(&[("topic", json!("rust")), ("approval", json!("ok"))]),
            durable(&store, "wf-approve"),
        )
        .await;

    assert!(resumed.is_completed(), "resume failed: {:?}", resumed.error);
    assert!(resumed.pause.is_none());
    assert_eq!(resumed.get("published"), Some(&json!("Post about rust [ok]")));

    let steps = store.load_steps("wf-approve").await.unwrap();
    let approvals: Vec<_> = steps.iter().filter(|s| s.node == "approve").collect();
    assert_eq!(approvals.len(), 1, "paused record must be updated, not duplicated");
    assert_eq!(approvals[0].status, StepStatus::Completed);
    assert_eq!(approvals[0].position(), (1, 0));
    assert_eq!(approvals[0].output_versions["approval"], 1);
    assert_eq!(steps.iter().filter(|s| s.node == "draft").count(), 1);
    assert_eq!(
        store.load_workflow("wf-approve").await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn test_resume_without_response_pauses_again() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let graph = approval_graph();
    let values = inputs(&[("topic", json!("tokio"))]);

    let first = AsyncRunner::new()
        .run(&graph, values.clone(), durable(&store, "wf-wait"))
        .await;
    assert!(first.is_paused());

    let second = AsyncRunner::new()
        .run(&graph, values, durable(&store, "wf-wait"))
        .await;
    assert!(second.is_paused());
    assert_eq!(second.pause, first.pause);

    let steps = store.load_steps("wf-wait").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].status, StepStatus::Paused);
}

#[tokio::test]
async fn test_auto_responder_answers_without_pausing() {
    let graph = Graph::builder()
        .node(draft())
        .node(
            InterruptNode::new("approve", "text", "approval").with_responder(|prompt| async move {
                let text = prompt.as_str().unwrap_or_default().to_string();
                Ok(text.contains("rust").then(|| json!("auto")))
            }),
        )
        .node(publish())
        .build()
        .unwrap();

    let answered = AsyncRunner::new()
        .run(&graph, inputs(&[("topic", json!("rust"))]), RunOptions::new())
        .await;
    assert!(answered.is_completed(), "run failed: {:?}", answered.error);
    assert_eq!(answered.get("published"), Some(&json!("Post about rust [auto]")));

    let declined = AsyncRunner::new()
        .run(&graph, inputs(&[("topic", json!("go"))]), RunOptions::new())
        .await;
    assert!(declined.is_paused());
}

/// draft → approve (pause) → review → (revise → draft | END)
///
/// The review gate sends the first approved draft back for one revision.
fn review_loop(reviews: Arc<AtomicUsize>) -> Graph {
    Graph::builder()
        .name("review-loop")
        .node(FunctionNode::new("draft", &["text"], &["draft"], |inputs| async move {
            let text: String = inputs.parse("text")?;
            Ok(NodeOutput::value("draft", json!(format!("{}!", text))))
        }))
        .node(InterruptNode::new("approve", "draft", "approval"))
        .node(GateNode::new(
            "review",
            &["approval"],
            ["revise", END],
            move |_| {
                let seen = reviews.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    Ok(if seen < 2 {
                        RouteDecision::to("revise")
                    } else {
                        RouteDecision::End
                    })
                }
            },
        ))
        .node(FunctionNode::new("revise", &["draft"], &["text"], |inputs| async move {
            Ok(NodeOutput::value("text", inputs.require("draft")?.clone()))
        }))
        .build()
        .expect("Failed to build graph")
}

#[tokio::test]
async fn test_loop_accepts_repeated_answer() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let reviews = Arc::new(AtomicUsize::new(0));
    let graph = review_loop(reviews.clone());
    assert!(graph.has_cycles());

    let first = AsyncRunner::new()
        .run(&graph, inputs(&[("text", json!("hi"))]), durable(&store, "wf-loop"))
        .await;
    assert!(first.is_paused());
    assert_eq!(first.pause.as_ref().map(|p| p.value.clone()), Some(json!("hi!")));

    let answer = inputs(&[("text", json!("hi")), ("approval", json!("ok"))]);
    let second = AsyncRunner::new()
        .run(&graph, answer.clone(), durable(&store, "wf-loop"))
        .await;
    assert!(second.is_paused(), "expected second pause, got {:?}", second.status);
    assert_eq!(second.pause.as_ref().map(|p| p.value.clone()), Some(json!("hi!!")));

    // same answer as before, for the new draft
    let third = AsyncRunner::new()
        .run(&graph, answer, durable(&store, "wf-loop"))
        .await;
    assert!(third.is_completed(), "repeated answer ignored: {:?}", third.status);
    assert_eq!(third.get("draft"), Some(&json!("hi!!")));
    assert_eq!(reviews.load(Ordering::SeqCst), 2);

    let steps = store.load_steps("wf-loop").await.unwrap();
    let approvals: Vec<_> = steps
        .iter()
        .filter(|s| s.node == "approve")
        .map(|s| (s.status, s.output_versions["approval"]))
        .collect();
    assert_eq!(
        approvals,
        vec![(StepStatus::Completed, 1), (StepStatus::Completed, 2)]
    );
}

// =============================================================================
// Nested pauses
// =============================================================================

#[tokio::test]
async fn test_nested_pause_resumes_from_top_level() {
    let store: SharedStepStore = Arc::new(MemoryStepStore::new());
    let inner = Graph::builder()
        .name("review")
        .node(InterruptNode::new("approve", "text", "approval"))
        .node(publish())
        .build()
        .expect("Failed to build inner graph");
    let outer = Graph::builder()
        .name("pipeline")
        .node(draft())
        .node(GraphNode::new("review", inner))
        .build()
        .expect("Failed to build outer graph");
    assert_eq!(outer.interrupt_responses(), ["approval".to_string()]);

    let paused = AsyncRunner::new()
        .run(
            &outer,
            inputs(&[("topic", json!("graphs"))]),
            durable(&store, "wf-nested"),
        )
        .await;

    assert!(paused.is_paused(), "expected pause, got {:?}", paused.error);
    let pause = paused.pause.as_ref().unwrap();
    assert_eq!(pause.path, "review/approve");
    assert_eq!(pause.node, "approve");
    assert!(pause.is_nested());
    assert!(paused.nested("review").map(RunResult::is_paused).unwrap_or(false));

    let resumed = AsyncRunner::new()
        .run(
            &outer,
            inputs(&[("topic", json!("graphs")), ("approval", json!("lgtm"))]),
            durable(&store, "wf-nested"),
        )
        .await;

    assert!(resumed.is_completed(), "resume failed: {:?}", resumed.error);
    assert_eq!(
        resumed.get("published"),
        Some(&json!("Post about graphs [lgtm]"))
    );
    let nested = resumed.nested("review").expect("nested result");
    assert!(nested.is_completed());
    assert_eq!(nested.workflow_id.as_deref(), Some("wf-nested/review"));

    let inner_steps = store.load_steps("wf-nested/review").await.unwrap();
    let approvals: Vec<_> = inner_steps.iter().filter(|s| s.node == "approve").collect();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, StepStatus::Completed);

    let outer_steps = store.load_steps("wf-nested").await.unwrap();
    let review: Vec<_> = outer_steps.iter().filter(|s| s.node == "review").collect();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].status, StepStatus::Completed);
}
