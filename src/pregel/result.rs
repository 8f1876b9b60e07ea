//! Run result assembly
//!
//! Folds the final state of a run, its status and any pause or error into
//! the caller-facing [`RunResult`]. Container nodes contribute their own
//! nested results instead of flat values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::error::RunError;
use super::interrupt::PauseInfo;
use super::state::StateStore;

/// Outcome of one run call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Paused,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which state names a run returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// Every name in the final state
    #[default]
    All,
    /// Output names nothing in the graph consumes
    Leaves,
    /// Exactly these names (missing ones are omitted)
    Names(Vec<String>),
}

impl Selection {
    /// Select the given names
    pub fn names<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Selection::Names(names.into_iter().map(Into::into).collect())
    }
}

/// A returned value: plain, or the result of a nested graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultValue {
    Value(Value),
    Nested(Box<RunResult>),
}

impl ResultValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResultValue::Value(value) => Some(value),
            ResultValue::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&RunResult> {
        match self {
            ResultValue::Nested(result) => Some(result),
            ResultValue::Value(_) => None,
        }
    }
}

/// Caller-facing outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    /// Set when the run was durable
    pub workflow_id: Option<String>,
    pub status: RunStatus,
    pub values: BTreeMap<String, ResultValue>,
    /// Pending pause, when `status` is `Paused`
    pub pause: Option<PauseInfo>,
    /// Cause, when `status` is `Failed`
    pub error: Option<RunError>,
    /// Supersteps executed by this call
    pub supersteps: usize,
}

impl RunResult {
    pub fn new(run_id: impl Into<String>, workflow_id: Option<String>, status: RunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id,
            status,
            values: BTreeMap::new(),
            pause: None,
            error: None,
            supersteps: 0,
        }
    }

    /// A failed result carrying `error`
    pub fn failed(run_id: impl Into<String>, workflow_id: Option<String>, error: RunError) -> Self {
        let mut result = Self::new(run_id, workflow_id, RunStatus::Failed);
        result.error = Some(error);
        result
    }

    /// Fill `values` from the final state.
    ///
    /// `leaves` is the graph's leaf output set, used by [`Selection::Leaves`].
    /// Nested results are keyed by container node name and take precedence
    /// over flat values of the same name.
    pub fn with_values(
        mut self,
        state: &StateStore,
        selection: &Selection,
        leaves: &[String],
        nested: BTreeMap<String, RunResult>,
    ) -> Self {
        let wanted = |name: &str| match selection {
            Selection::All => true,
            Selection::Leaves => leaves.iter().any(|l| l == name),
            Selection::Names(names) => names.iter().any(|n| n == name),
        };

        self.values = state
            .versioned()
            .iter()
            .filter(|(name, _)| wanted(name))
            .map(|(name, v)| (name.clone(), ResultValue::Value(v.value.clone())))
            .collect();

        for (name, result) in nested {
            let keep = match selection {
                Selection::Names(names) => names.iter().any(|n| n == &name),
                _ => true,
            };
            if keep {
                self.values.insert(name, ResultValue::Nested(Box::new(result)));
            }
        }
        self
    }

    /// Plain value of `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(ResultValue::as_value)
    }

    /// Nested result recorded under container node `name`
    pub fn nested(&self, name: &str) -> Option<&RunResult> {
        self.values.get(name).and_then(ResultValue::as_nested)
    }

    /// Plain values only, without nested results
    pub fn plain_values(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_paused(&self) -> bool {
        self.status == RunStatus::Paused
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    pub fn is_stopped(&self) -> bool {
        self.status == RunStatus::Stopped
    }

    /// Convert a failed result into its error, for `?` at call sites
    pub fn into_result(self) -> Result<RunResult, RunError> {
        match (&self.status, &self.error) {
            (RunStatus::Failed, Some(error)) => Err(error.clone()),
            (RunStatus::Failed, None) => Err(RunError::internal("run failed without an error")),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static_assertions::assert_impl_all!(RunResult: Send, Sync, Clone);

    fn state() -> StateStore {
        let mut state = StateStore::new();
        state.set("query", json!("hi"));
        state.set("docs", json!(["a"]));
        state.set("answer", json!("hello"));
        state
    }

    #[test]
    fn test_select_all() {
        let result = RunResult::new("r", None, RunStatus::Completed).with_values(
            &state(),
            &Selection::All,
            &[],
            BTreeMap::new(),
        );
        assert_eq!(result.values.len(), 3);
        assert_eq!(result.get("answer"), Some(&json!("hello")));
    }

    #[test]
    fn test_select_leaves_and_names() {
        let leaves = vec!["answer".to_string()];
        let result = RunResult::new("r", None, RunStatus::Completed).with_values(
            &state(),
            &Selection::Leaves,
            &leaves,
            BTreeMap::new(),
        );
        assert_eq!(result.values.keys().collect::<Vec<_>>(), vec!["answer"]);

        let result = RunResult::new("r", None, RunStatus::Completed).with_values(
            &state(),
            &Selection::names(["docs", "missing"]),
            &leaves,
            BTreeMap::new(),
        );
        assert_eq!(result.values.keys().collect::<Vec<_>>(), vec!["docs"]);
    }

    #[test]
    fn test_nested_results() {
        let inner = RunResult::new("inner", Some("wf/review".into()), RunStatus::Completed);
        let mut nested = BTreeMap::new();
        nested.insert("review".to_string(), inner);

        let result = RunResult::new("outer", Some("wf".into()), RunStatus::Completed)
            .with_values(&state(), &Selection::All, &[], nested);

        assert_eq!(result.nested("review").unwrap().run_id, "inner");
        assert!(result.get("review").is_none());
        assert_eq!(result.plain_values().len(), 3);
    }

    #[test]
    fn test_into_result() {
        let ok = RunResult::new("r", None, RunStatus::Paused);
        assert!(ok.into_result().is_ok());

        let failed = RunResult::failed("r", None, RunError::cycle_runaway(3));
        assert_eq!(failed.into_result().unwrap_err(), RunError::cycle_runaway(3));
    }
}
