//! Routing restriction
//!
//! Routing state is never stored separately: it is derived from the gates'
//! completed step records. A node targeted by at least one gate is eligible
//! only while one of those gates has a decision naming it that is newer than
//! the node's own last completed run. Nodes on branches that were never
//! selected therefore never produce a step record.

use std::collections::BTreeMap;

use super::error::RunError;
use super::step::StepLog;
use crate::workflow::node::{GateSpec, RouteDecision};

/// Gate → target relationships of one graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// target node → gates that may activate it
    gates_of: BTreeMap<String, Vec<String>>,
}

impl RoutingTable {
    /// Build from `(gate name, spec)` pairs
    pub fn new<'a>(gates: impl IntoIterator<Item = (&'a str, &'a GateSpec)>) -> Self {
        let mut gates_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (gate, spec) in gates {
            for target in &spec.targets {
                let entry = gates_of.entry(target.clone()).or_default();
                if !entry.iter().any(|g| g == gate) {
                    entry.push(gate.to_string());
                }
            }
        }
        Self { gates_of }
    }

    /// Whether any gate controls `node`
    pub fn is_gated(&self, node: &str) -> bool {
        self.gates_of.contains_key(node)
    }

    /// Gates that may activate `node`
    pub fn gates_of(&self, node: &str) -> &[String] {
        self.gates_of.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether routing currently allows `node` to run
    pub fn is_eligible(&self, node: &str, log: &StepLog) -> bool {
        let Some(gates) = self.gates_of.get(node) else {
            return true;
        };

        let last_run = log.latest_completed(node).map(|r| r.position());

        gates.iter().any(|gate| {
            let Some(record) = log.latest_completed(gate) else {
                return false;
            };
            let selected = record
                .decision
                .as_ref()
                .map(|d| d.activates(node))
                .unwrap_or(false);
            selected && last_run.map(|p| record.position() > p).unwrap_or(true)
        })
    }
}

/// Check a gate's decision against its declared target set
pub fn validate_decision(
    gate: &str,
    spec: &GateSpec,
    decision: &RouteDecision,
) -> Result<(), RunError> {
    let targets = match decision {
        RouteDecision::End => {
            return if spec.declares(crate::workflow::graph::END) {
                Ok(())
            } else {
                Err(RunError::invalid_route(gate, "END is not a declared target"))
            };
        }
        RouteDecision::Targets(targets) => targets,
    };

    if targets.is_empty() {
        return Err(RunError::invalid_route(gate, "decision selects no target"));
    }
    if targets.len() > 1 && !spec.multi_target {
        return Err(RunError::invalid_route(
            gate,
            format!("selected {} targets but gate is single-target", targets.len()),
        ));
    }
    if let Some(unknown) = targets.iter().find(|t| !spec.declares(t)) {
        return Err(RunError::invalid_route(
            gate,
            format!("'{}' is not a declared target", unknown),
        ));
    }
    Ok(())
}
