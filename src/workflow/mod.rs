//! Workflow graph construction
//!
//! This module provides the building blocks for describing dataflow graphs
//! executed by the [`pregel`](crate::pregel) runtime.
//!
//! # Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Graph                                │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Nodes                             │    │
//! │  │  ┌─────────┐  ┌─────────┐  ┌──────────┐             │    │
//! │  │  │  embed  │→ │retrieve │→ │ generate │             │    │
//! │  │  └─────────┘  └─────────┘  └────┬─────┘             │    │
//! │  │        edges inferred from       │                   │    │
//! │  │        output/input names  ┌─────▼─────┐             │    │
//! │  │                            │   gate    │             │    │
//! │  │                            └───────────┘             │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                              │
//! │  Build via GraphBuilder → Graph                              │
//! │  Execute via AsyncRunner / SyncRunner                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nodeflow::workflow::{Graph, vertices::FunctionNode};
//!
//! let graph = Graph::builder()
//!     .name("rag")
//!     .node(FunctionNode::new("embed", &["query"], &["vector"], embed))
//!     .node(FunctionNode::new("retrieve", &["vector"], &["docs"], retrieve).suspendable())
//!     .node(FunctionNode::new("generate", &["docs", "query"], &["answer"], generate))
//!     .build()?;
//! ```

pub mod graph;
pub mod node;
pub mod vertices;

pub use graph::{Edge, Graph, GraphBuilder, GraphEntry, GraphError, END};
pub use node::{
    BoxedNode, GateSpec, InterruptSpec, Node, NodeCapabilities, NodeInputs, NodeKind, NodeOutput,
    RouteDecision, ValueStream,
};
