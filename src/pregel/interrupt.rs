//! Interrupt coordinator
//!
//! A pause-capable node surfaces a value to an external party and waits for
//! a response written under a declared name. The run halts with status
//! `paused`; supplying the response through the ordinary run entry point
//! makes the node complete in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::state::{StateStore, Version};
use super::step::{StepLog, StepStatus};
use crate::workflow::node::InterruptSpec;

/// Details of a pending pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    /// Node that paused, innermost
    pub node: String,
    /// Slash-separated node path from the top-level graph
    pub path: String,
    /// Value surfaced to the external party
    pub value: Value,
    /// Name the response must be supplied under
    pub response_key: String,
}

impl PauseInfo {
    pub fn new(node: impl Into<String>, value: Value, response_key: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            path: node.clone(),
            node,
            value,
            response_key: response_key.into(),
        }
    }

    /// Re-root this pause under a container node of the enclosing graph
    pub fn nested_under(mut self, container: &str) -> Self {
        self.path = format!("{}/{}", container, self.path);
        self
    }

    /// Whether the pause comes from a nested graph
    pub fn is_nested(&self) -> bool {
        self.path.contains('/')
    }
}

/// A response that has arrived since the node last completed
#[derive(Debug, Clone, PartialEq)]
pub struct FreshResponse {
    pub value: Value,
    pub version: Version,
}

/// Look for a response the interrupt node has not consumed yet.
///
/// The response is fresh when it is present and its version differs from
/// the one recorded by the node's last completed execution. A response
/// already consumed by an earlier traversal of a cycle is not fresh, so the
/// node pauses again.
pub fn fresh_response(
    node: &str,
    spec: &InterruptSpec,
    state: &StateStore,
    log: &StepLog,
) -> Option<FreshResponse> {
    let value = state.get(&spec.response)?;
    let version = state.version_of(&spec.response);

    let consumed = log
        .latest_completed(node)
        .and_then(|r| r.output_versions.get(&spec.response).copied());

    if consumed == Some(version) {
        return None;
    }

    Some(FreshResponse {
        value: value.clone(),
        version,
    })
}

/// Response names the log is still waiting on.
///
/// One name per node whose latest record is a pause, including pauses
/// raised inside a nested graph and surfaced by its container.
pub fn awaited_responses<'a>(
    nodes: impl IntoIterator<Item = &'a str>,
    log: &StepLog,
) -> BTreeSet<String> {
    nodes
        .into_iter()
        .filter_map(|node| log.latest(node))
        .filter(|record| record.status == StepStatus::Paused)
        .filter_map(|record| record.pause.as_ref().map(|p| p.response_key.clone()))
        .collect()
}
