//! Step records and the in-memory step log
//!
//! The step log is the implicit cursor of a workflow: there is no program
//! counter, only the ordered list of per-node outcomes. Every scheduling
//! decision ("is this node stale", "was this branch selected") is answered
//! from these records, which is why a restored log reproduces the same
//! decisions as an uninterrupted run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::checkpoint::StepStore;
use super::error::RunError;
use super::interrupt::PauseInfo;
use super::result::RunResult;
use super::state::{InputVersions, Version, VersionedValue};
use crate::workflow::node::RouteDecision;

/// Outcome of one node execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Paused,
    Stopped,
}

impl StepStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepStatus::Completed)
    }
}

/// The durable record of one node's execution within one superstep.
///
/// Identity is `(workflow_id, superstep, node)`; a paused record is later
/// updated in place rather than duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Owning workflow, `None` for ephemeral runs
    pub workflow_id: Option<String>,
    pub superstep: usize,
    pub node: String,
    /// Alphabetical position within the superstep
    pub index: usize,
    /// Versions of the required inputs the node consumed
    pub input_versions: InputVersions,
    pub status: StepStatus,
    /// Values produced. `None` when nothing was produced or the node opts out
    /// of persistence.
    #[serde(default)]
    pub outputs: Option<BTreeMap<String, Value>>,
    /// Version each produced name was committed at
    #[serde(default)]
    pub output_versions: BTreeMap<String, Version>,
    /// Routing decision of a gate
    #[serde(default)]
    pub decision: Option<RouteDecision>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pause: Option<PauseInfo>,
    /// Nested run outcome of a container node
    #[serde(default)]
    pub nested: Option<Box<RunResult>>,
    /// Output truncated by a stop request but still usable
    #[serde(default)]
    pub partial: bool,
    /// Outputs served from the node cache
    #[serde(default)]
    pub cached: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Start a record for a node about to execute
    pub fn begin(
        workflow_id: Option<String>,
        superstep: usize,
        node: impl Into<String>,
        index: usize,
        input_versions: InputVersions,
    ) -> Self {
        Self {
            workflow_id,
            superstep,
            node: node.into(),
            index,
            input_versions,
            status: StepStatus::Completed,
            outputs: None,
            output_versions: BTreeMap::new(),
            decision: None,
            error: None,
            pause: None,
            nested: None,
            partial: false,
            cached: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Position of this record in replay order
    pub fn position(&self) -> (usize, usize) {
        (self.superstep, self.index)
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Mark the record finished with `status`
    pub fn finish(&mut self, status: StepStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Fold caller inputs and step outputs into the newest value of every name
pub fn fold_latest_values<'a>(
    inputs: impl IntoIterator<Item = (&'a String, &'a VersionedValue)>,
    steps: impl IntoIterator<Item = &'a StepRecord>,
) -> HashMap<String, VersionedValue> {
    let mut latest: HashMap<String, VersionedValue> = inputs
        .into_iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut keep = |name: &String, value: &Value, version: Version| {
        let newer = latest.get(name).map(|v| version > v.version).unwrap_or(true);
        if newer {
            latest.insert(name.clone(), VersionedValue::new(value.clone(), version));
        }
    };

    for step in steps {
        if !matches!(step.status, StepStatus::Completed | StepStatus::Stopped) {
            continue;
        }
        let Some(outputs) = &step.outputs else {
            continue;
        };
        for (name, value) in outputs {
            if let Some(version) = step.output_versions.get(name) {
                keep(name, value, *version);
            }
        }
    }

    latest
}

/// Ordered, in-memory view of a workflow's step records with optional
/// write-through to a durability port.
pub struct StepLog {
    workflow_id: Option<String>,
    records: Vec<StepRecord>,
    store: Option<Arc<dyn StepStore>>,
}

impl StepLog {
    /// Empty ephemeral log
    pub fn ephemeral() -> Self {
        Self {
            workflow_id: None,
            records: Vec::new(),
            store: None,
        }
    }

    /// Log backed by `store` under `workflow_id`, seeded with prior records
    pub fn durable(
        workflow_id: impl Into<String>,
        store: Arc<dyn StepStore>,
        mut records: Vec<StepRecord>,
    ) -> Self {
        records.sort_by_key(StepRecord::position);
        Self {
            workflow_id: Some(workflow_id.into()),
            records,
            store: Some(store),
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id.as_deref()
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace the record with the same `(superstep, node)`
    /// identity, then write it through to the durability port.
    pub async fn upsert(&mut self, record: StepRecord) -> Result<(), RunError> {
        if let (Some(store), Some(workflow_id)) = (&self.store, &self.workflow_id) {
            store.append_or_update_step(workflow_id, &record).await?;
        }

        match self
            .records
            .iter_mut()
            .find(|r| r.superstep == record.superstep && r.node == record.node)
        {
            Some(existing) => *existing = record,
            None => {
                let at = self
                    .records
                    .partition_point(|r| r.position() <= record.position());
                self.records.insert(at, record);
            }
        }
        Ok(())
    }

    /// Most recent record of `node`, whatever its status
    pub fn latest(&self, node: &str) -> Option<&StepRecord> {
        self.records.iter().rev().find(|r| r.node == node)
    }

    /// Most recent completed record of `node`
    pub fn latest_completed(&self, node: &str) -> Option<&StepRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.node == node && r.is_completed())
    }

    /// Whether `node` must run given the versions it would consume now.
    ///
    /// A node is fresh only when some completed record consumed exactly
    /// these versions.
    pub fn is_stale(&self, node: &str, versions: &InputVersions) -> bool {
        !self
            .records
            .iter()
            .any(|r| r.node == node && r.is_completed() && &r.input_versions == versions)
    }

    /// Superstep index the next round should use
    pub fn next_superstep(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.superstep + 1)
            .max()
            .unwrap_or(0)
    }

    /// Records of `node`, oldest first
    pub fn history<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.records.iter().filter(move |r| r.node == node)
    }

    /// Highest version any record committed `name` at, 0 if never
    pub fn max_output_version(&self, name: &str) -> Version {
        self.records
            .iter()
            .filter_map(|r| r.output_versions.get(name).copied())
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for StepLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLog")
            .field("workflow_id", &self.workflow_id)
            .field("records", &self.records.len())
            .field("durable", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pregel::checkpoint::{MemoryStepStore, StepStore};
    use serde_json::json;

    fn completed(superstep: usize, node: &str, index: usize, versions: &[(&str, u64)]) -> StepRecord {
        let input_versions = versions
            .iter()
            .map(|(n, v)| (n.to_string(), *v))
            .collect();
        let mut record = StepRecord::begin(None, superstep, node, index, input_versions);
        record.finish(StepStatus::Completed);
        record
    }

    #[test]
    fn test_staleness_is_exact_version_match() {
        let mut log = StepLog::ephemeral();
        log.records.push(completed(0, "a", 0, &[("x", 1)]));

        let same: InputVersions = [("x".to_string(), 1)].into_iter().collect();
        let newer: InputVersions = [("x".to_string(), 2)].into_iter().collect();
        assert!(!log.is_stale("a", &same));
        assert!(log.is_stale("a", &newer));
        assert!(log.is_stale("b", &same));
    }

    #[test]
    fn test_paused_record_is_not_fresh() {
        let mut log = StepLog::ephemeral();
        let mut record = completed(0, "ask", 0, &[("q", 1)]);
        record.status = StepStatus::Paused;
        log.records.push(record);

        let versions: InputVersions = [("q".to_string(), 1)].into_iter().collect();
        assert!(log.is_stale("ask", &versions));
        assert!(log.latest_completed("ask").is_none());
        assert!(log.latest("ask").is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_identity() {
        let store = Arc::new(MemoryStepStore::new());
        let mut log = StepLog::durable("wf", store.clone(), Vec::new());

        let mut record = completed(3, "ask", 0, &[]);
        record.status = StepStatus::Paused;
        log.upsert(record.clone()).await.unwrap();

        record.status = StepStatus::Completed;
        log.upsert(record).await.unwrap();

        assert_eq!(log.len(), 1);
        assert!(log.records()[0].is_completed());

        let persisted = store.load_steps("wf").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_upsert_keeps_replay_order() {
        let mut log = StepLog::ephemeral();
        log.upsert(completed(1, "c", 0, &[])).await.unwrap();
        log.upsert(completed(0, "b", 1, &[])).await.unwrap();
        log.upsert(completed(0, "a", 0, &[])).await.unwrap();

        let order: Vec<_> = log.records().iter().map(|r| r.node.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(log.next_superstep(), 2);
    }

    #[test]
    fn test_fold_latest_values_prefers_highest_version() {
        let mut inputs = BTreeMap::new();
        inputs.insert("q".to_string(), VersionedValue::new(json!("hi"), 1));

        let mut first = completed(0, "a", 0, &[]);
        first.outputs = Some([("x".to_string(), json!(1))].into_iter().collect());
        first.output_versions.insert("x".into(), 1);

        let mut second = completed(2, "c", 0, &[]);
        second.outputs = Some([("x".to_string(), json!(3))].into_iter().collect());
        second.output_versions.insert("x".into(), 2);

        let mut failed = completed(3, "d", 0, &[]);
        failed.status = StepStatus::Failed;
        failed.outputs = Some([("x".to_string(), json!(99))].into_iter().collect());
        failed.output_versions.insert("x".into(), 9);

        let latest = fold_latest_values(&inputs, [&second, &first, &failed]);
        assert_eq!(latest["x"], VersionedValue::new(json!(3), 2));
        assert_eq!(latest["q"].version, 1);
    }
}
