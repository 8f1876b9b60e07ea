//! nodeflow: superstep runtime for dataflow workflow graphs
//!
//! Nodes declare the names they read and write; the runtime runs every
//! node whose inputs changed, round after round, until nothing is stale.
//! - Versioned state: staleness is a version comparison, not a dirty flag
//! - Step log: every execution is recorded and doubles as the resume cursor
//! - Interrupts: a node can pause the run until a response arrives
//! - Bounded concurrency: one permit pool for the whole run, nested graphs
//!   and batch items included
//!
//! # Example
//!
//! ```rust,ignore
//! use nodeflow::prelude::*;
//!
//! let graph = Graph::builder()
//!     .node(FunctionNode::new("double", &["x"], &["y"], |inputs| async move {
//!         let x: i64 = inputs.parse("x")?;
//!         Ok(NodeOutput::value("y", json!(x * 2)))
//!     }))
//!     .build()?;
//!
//! let result = AsyncRunner::new()
//!     .run(&graph, values, RunOptions::new().with_max_concurrency(4))
//!     .await
//!     .into_result()?;
//! ```

pub mod pregel;
pub mod workflow;

// Re-exports for convenience
pub use pregel::{
    AsyncRunner, ChannelSink, CollectingSink, Event, EventKind, EventSink, FileStepStore,
    InMemoryCache, MemoryStepStore, NodeCache, NodeContext, PauseInfo, ResultValue, RunConfig,
    RunError, RunOptions, RunResult, RunStatus, Selection, StepRecord, StepStatus, StepStore,
    StopSignal, StoreConfig, SyncRunner, TracingSink, WorkflowRecord, WorkflowStatus,
};
pub use workflow::vertices::{
    Branch, BranchCondition, ConditionGate, FunctionNode, GateNode, GraphNode, InterruptNode,
    StreamNode,
};
pub use workflow::{Graph, GraphBuilder, GraphError, Node, NodeInputs, NodeOutput, RouteDecision, END};

/// Everything needed to build and run a graph
pub mod prelude {
    pub use crate::pregel::{
        AsyncRunner, NodeContext, RunConfig, RunError, RunOptions, RunResult, RunStatus,
        Selection, StopSignal, SyncRunner,
    };
    pub use crate::workflow::vertices::*;
    pub use crate::workflow::{Graph, Node, NodeInputs, NodeOutput, RouteDecision, END};
    pub use serde_json::{json, Value};
}
