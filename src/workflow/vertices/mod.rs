//! Concrete node kinds
//!
//! Each type implements the [`Node`](crate::workflow::node::Node) trait and
//! corresponds to a [`NodeKind`](crate::workflow::node::NodeKind) variant.
//!
//! # Available Nodes
//!
//! - [`function::FunctionNode`]: async closure over named inputs
//! - [`gate::GateNode`]: closure-backed routing decision
//! - [`gate::ConditionGate`]: declarative branches over one input value
//! - [`interrupt::InterruptNode`]: pauses until a response is supplied
//! - [`stream::StreamNode`]: lazy sequence folded into one array
//! - [`subgraph::GraphNode`]: nested graph run as a single node

pub mod function;
pub mod gate;
pub mod interrupt;
pub mod stream;
pub mod subgraph;

// Re-export main node types
pub use function::FunctionNode;
pub use gate::{Branch, BranchCondition, ConditionGate, GateNode};
pub use interrupt::InterruptNode;
pub use stream::StreamNode;
pub use subgraph::GraphNode;
