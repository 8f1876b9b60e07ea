//! Gate nodes: routing-only nodes that select which targets may run next
//!
//! - [`GateNode`]: closure-backed decision
//! - [`ConditionGate`]: declarative branches evaluated against one input

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::function::to_names;
use crate::pregel::context::NodeContext;
use crate::workflow::graph::END;
use crate::workflow::node::{GateSpec, Node, NodeInputs, NodeKind, NodeOutput, RouteDecision};

type GateBody = Arc<dyn Fn(NodeInputs) -> BoxFuture<'static, anyhow::Result<RouteDecision>> + Send + Sync>;

/// A gate whose decision is computed by an async closure
#[derive(Clone)]
pub struct GateNode {
    name: String,
    inputs: Vec<String>,
    spec: GateSpec,
    body: GateBody,
}

impl GateNode {
    /// Create a single-target gate over `targets` (node names or [`END`])
    pub fn new<I, T, F, Fut>(name: impl Into<String>, inputs: &[&str], targets: I, body: F) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RouteDecision>> + Send + 'static,
    {
        Self {
            name: name.into(),
            inputs: to_names(inputs),
            spec: GateSpec::new(targets.into_iter().map(Into::into).collect(), false),
            body: Arc::new(move |inputs: NodeInputs| body(inputs).boxed()),
        }
    }

    /// Allow one decision to activate several targets
    pub fn multi_target(mut self) -> Self {
        self.spec.multi_target = true;
        self
    }
}

#[async_trait]
impl Node for GateNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &[]
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Gate(self.spec.clone())
    }

    async fn invoke(&self, inputs: NodeInputs, _ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        Ok(NodeOutput::Route((self.body)(inputs).await?))
    }
}

impl std::fmt::Debug for GateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("spec", &self.spec)
            .finish()
    }
}

/// A routing branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Target node for this branch
    pub target: String,

    /// Condition that must be true for this branch
    pub condition: BranchCondition,
}

impl Branch {
    pub fn new(target: impl Into<String>, condition: BranchCondition) -> Self {
        Self {
            target: target.into(),
            condition,
        }
    }
}

/// Condition for a routing branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BranchCondition {
    /// Value equals expected
    Equals { value: Value },

    /// Value is in set of options
    In { values: Vec<Value> },

    /// Value matches regex pattern
    Matches { pattern: String },

    /// Numeric value is strictly greater
    GreaterThan { value: f64 },

    /// Numeric value is strictly less
    LessThan { value: f64 },

    /// Value is truthy (non-null, non-empty, non-false)
    IsTruthy,

    /// Value is falsy
    IsFalsy,

    /// Always true (used for catch-all branches)
    Always,
}

impl BranchCondition {
    /// Evaluate the condition against a value
    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            BranchCondition::Equals { value: expected } => value == expected,
            BranchCondition::In { values } => values.contains(value),
            BranchCondition::Matches { pattern } => match value.as_str() {
                Some(text) => regex::Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false), // Invalid regex doesn't match
                None => false,
            },
            BranchCondition::GreaterThan { value: bound } => {
                value.as_f64().map(|n| n > *bound).unwrap_or(false)
            }
            BranchCondition::LessThan { value: bound } => {
                value.as_f64().map(|n| n < *bound).unwrap_or(false)
            }
            BranchCondition::IsTruthy => match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Value::String(s) => !s.is_empty(),
                Value::Array(arr) => !arr.is_empty(),
                Value::Object(obj) => !obj.is_empty(),
                Value::Null => false,
            },
            BranchCondition::IsFalsy => !BranchCondition::IsTruthy.evaluate(value),
            BranchCondition::Always => true,
        }
    }
}

/// A gate routing on one input value.
///
/// `field` is an input name optionally followed by a dotted path into the
/// value (`"review.score"` reads `score` from input `review`). Branches are
/// tried in order; the first match wins, then `default`.
#[derive(Debug, Clone)]
pub struct ConditionGate {
    name: String,
    field: String,
    inputs: Vec<String>,
    branches: Vec<Branch>,
    default: Option<String>,
    spec: GateSpec,
}

impl ConditionGate {
    pub fn new(name: impl Into<String>, field: impl Into<String>, branches: Vec<Branch>) -> Self {
        let field = field.into();
        let input = field.split('.').next().unwrap_or_default().to_string();
        let mut gate = Self {
            name: name.into(),
            field,
            inputs: vec![input],
            branches,
            default: None,
            spec: GateSpec::new(Vec::new(), false),
        };
        gate.spec.targets = gate.targets();
        gate
    }

    /// Target used when no branch matches
    pub fn with_default(mut self, target: impl Into<String>) -> Self {
        self.default = Some(target.into());
        self.spec.targets = self.targets();
        self
    }

    fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for target in self
            .branches
            .iter()
            .map(|b| &b.target)
            .chain(self.default.as_ref())
        {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        targets
    }

    /// Resolve the dotted field path against the inputs
    fn resolve(&self, inputs: &NodeInputs) -> Option<Value> {
        let mut parts = self.field.split('.');
        let mut current = inputs.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(obj) => obj.get(part)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Pick a target for `inputs`
    pub fn decide(&self, inputs: &NodeInputs) -> Option<String> {
        if let Some(value) = self.resolve(inputs) {
            if let Some(branch) = self.branches.iter().find(|b| b.condition.evaluate(&value)) {
                return Some(branch.target.clone());
            }
        }
        self.default.clone()
    }
}

#[async_trait]
impl Node for ConditionGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &[]
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Gate(self.spec.clone())
    }

    fn signature(&self) -> String {
        let branches = serde_json::to_string(&self.branches).unwrap_or_default();
        format!(
            "{}|gate|field={}|branches={}|default={}",
            self.name,
            self.field,
            branches,
            self.default.as_deref().unwrap_or(END)
        )
    }

    async fn invoke(&self, inputs: NodeInputs, _ctx: &NodeContext) -> anyhow::Result<NodeOutput> {
        match self.decide(&inputs) {
            Some(target) => Ok(NodeOutput::Route(RouteDecision::to(target))),
            None => anyhow::bail!("no branch of gate '{}' matched and no default is set", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn inputs(name: &str, value: Value) -> NodeInputs {
        let mut values = BTreeMap::new();
        values.insert(name.to_string(), value);
        NodeInputs::new(values)
    }

    #[test]
    fn test_evaluate_conditions() {
        assert!(BranchCondition::Equals { value: json!("a") }.evaluate(&json!("a")));
        assert!(BranchCondition::In { values: vec![json!(1), json!(2)] }.evaluate(&json!(2)));
        assert!(BranchCondition::Matches { pattern: "^err".into() }.evaluate(&json!("error")));
        assert!(!BranchCondition::Matches { pattern: "(".into() }.evaluate(&json!("(")));
        assert!(BranchCondition::GreaterThan { value: 0.5 }.evaluate(&json!(0.7)));
        assert!(BranchCondition::LessThan { value: 0.5 }.evaluate(&json!(0.4)));
        assert!(!BranchCondition::LessThan { value: 0.5 }.evaluate(&json!("0.4")));
        assert!(BranchCondition::IsTruthy.evaluate(&json!([1])));
        assert!(BranchCondition::IsFalsy.evaluate(&json!("")));
        assert!(BranchCondition::Always.evaluate(&Value::Null));
    }

    #[test]
    fn test_condition_gate_routes_by_score() {
        let gate = ConditionGate::new(
            "router",
            "score",
            vec![Branch::new("branch_a", BranchCondition::GreaterThan { value: 0.5 })],
        )
        .with_default("branch_b");

        assert_eq!(gate.decide(&inputs("score", json!(0.9))), Some("branch_a".into()));
        assert_eq!(gate.decide(&inputs("score", json!(0.4))), Some("branch_b".into()));
        assert_eq!(
            gate.kind(),
            NodeKind::Gate(GateSpec::new(vec!["branch_a".into(), "branch_b".into()], false))
        );
    }

    #[test]
    fn test_condition_gate_nested_field() {
        let gate = ConditionGate::new(
            "review_router",
            "review.verdict",
            vec![
                Branch::new("publish", BranchCondition::Equals { value: json!("approve") }),
                Branch::new(END, BranchCondition::Always),
            ],
        );

        assert_eq!(gate.inputs(), ["review".to_string()]);
        let approve = inputs("review", json!({"verdict": "approve"}));
        assert_eq!(gate.decide(&approve), Some("publish".into()));
        let reject = inputs("review", json!({"verdict": "reject"}));
        assert_eq!(gate.decide(&reject), Some(END.into()));
    }

    #[test]
    fn test_signature_tracks_branches() {
        let a = ConditionGate::new("g", "x", vec![Branch::new("a", BranchCondition::IsTruthy)]);
        let b = ConditionGate::new("g", "x", vec![Branch::new("a", BranchCondition::IsFalsy)]);
        assert_ne!(a.signature(), b.signature());
    }
}
