//! Error types for the superstep runtime
//!
//! `RunError` is the single taxonomy every aborted run reports. It is
//! `Clone` so it can travel inside a [`RunResult`](super::result::RunResult).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a run
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// A required input can never become available
    #[error("Missing input for node '{node}': {names:?}")]
    MissingInput { node: String, names: Vec<String> },

    /// Two active nodes write the same name in one superstep
    #[error("Conflict on '{name}' in superstep {superstep}: produced by {producers:?}")]
    Conflict {
        name: String,
        superstep: usize,
        producers: Vec<String>,
    },

    /// Superstep ceiling exceeded
    #[error("Cycle runaway: exceeded {max_iterations} supersteps")]
    CycleRunaway { max_iterations: usize },

    /// The runner cannot execute a feature the graph requires
    #[error("Runner '{runner}' does not support {capability}")]
    IncompatibleCapability { runner: String, capability: String },

    /// A node body returned an error
    #[error("Node '{node}' failed: {message}")]
    NodeFailure { node: String, message: String },

    /// Graph definition changed since the workflow last ran
    #[error("Graph changed for workflow '{workflow_id}': expected {expected}, found {found}")]
    VersionMismatch {
        workflow_id: String,
        expected: String,
        found: String,
    },

    /// A gate selected a target outside its declared set (or none at all)
    #[error("Invalid route from gate '{gate}': {reason}")]
    InvalidRoute { gate: String, reason: String },

    /// The durability port failed
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// The execution substrate failed (panicked task, runtime construction)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RunError {
    /// Create a missing input error
    pub fn missing_input(node: impl Into<String>, names: Vec<String>) -> Self {
        Self::MissingInput {
            node: node.into(),
            names,
        }
    }

    /// Create a conflict error
    pub fn conflict(name: impl Into<String>, superstep: usize, producers: Vec<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            superstep,
            producers,
        }
    }

    /// Create a cycle runaway error
    pub fn cycle_runaway(max_iterations: usize) -> Self {
        Self::CycleRunaway { max_iterations }
    }

    /// Create an incompatible capability error
    pub fn incompatible(runner: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::IncompatibleCapability {
            runner: runner.into(),
            capability: capability.into(),
        }
    }

    /// Create a node failure from the node's own error
    pub fn node_failure(node: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::NodeFailure {
            node: node.into(),
            message: format!("{:#}", error),
        }
    }

    /// Create a version mismatch error
    pub fn version_mismatch(
        workflow_id: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::VersionMismatch {
            workflow_id: workflow_id.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an invalid route error
    pub fn invalid_route(gate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRoute {
            gate: gate.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the same run unchanged.
    ///
    /// The core never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunError::NodeFailure { .. } | RunError::Storage { .. } | RunError::Internal { .. }
        )
    }

    /// Whether the error is raised before any node of the round executes
    pub fn aborts_before_execution(&self) -> bool {
        matches!(
            self,
            RunError::MissingInput { .. }
                | RunError::Conflict { .. }
                | RunError::CycleRunaway { .. }
                | RunError::IncompatibleCapability { .. }
                | RunError::VersionMismatch { .. }
        )
    }
}
