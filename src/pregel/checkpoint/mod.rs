//! Durability port for step history
//!
//! The scheduler persists every step record as it is committed and, on
//! resume, rebuilds its state purely from what this port returns. Nothing
//! else is needed to continue a workflow: no program counter, no snapshot
//! of the scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  StepStore                    │
//! │      ┌──────────┐          ┌──────────┐       │
//! │      │  Memory  │          │   File   │       │
//! │      └──────────┘          └──────────┘       │
//! │            │                     │            │
//! │            └──────────┬──────────┘            │
//! │                       ▼                       │
//! │        WorkflowRecord + Vec<StepRecord>       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nodeflow::pregel::checkpoint::{create_store, StoreConfig};
//!
//! let store = create_store(StoreConfig::File {
//!     path: PathBuf::from("./workflows"),
//!     compression: true,
//! });
//!
//! let options = RunOptions::new().with_workflow_id("order-42").with_store(store);
//! ```

mod file;

pub use file::FileStepStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use super::error::RunError;
use super::state::VersionedValue;
use super::step::{fold_latest_values, StepRecord};

/// Lifecycle of a durable workflow. Paused and stopped runs stay `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Completed,
    Failed,
}

/// Durable envelope of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub status: WorkflowStatus,
    /// Definition hash of the graph that created the workflow
    pub graph_hash: String,
    /// Caller-supplied values with the versions they were written at
    #[serde(default)]
    pub inputs: BTreeMap<String, VersionedValue>,
    /// Latest superstep that was started, kept until the workflow completes
    #[serde(default)]
    pub open_round: Option<OpenRound>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(id: impl Into<String>, graph_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: WorkflowStatus::Active,
            graph_hash: graph_hash.into(),
            inputs: BTreeMap::new(),
            open_round: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status and bump `updated_at`
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// A superstep as it was started: its index and its candidates in index
/// order. A resumed call re-enters it when the nodes left to run were all
/// candidates of it and none of them completed there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRound {
    pub superstep: usize,
    pub candidates: Vec<String>,
}

impl OpenRound {
    pub fn new(superstep: usize, candidates: Vec<String>) -> Self {
        Self {
            superstep,
            candidates,
        }
    }

    /// Position of `node` within the round
    pub fn index_of(&self, node: &str) -> Option<usize> {
        self.candidates.iter().position(|c| c == node)
    }
}

/// Durability port consumed by the scheduler.
///
/// Implementations must make `append_or_update_step` idempotent on the
/// record identity `(workflow_id, superstep, node)`.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert a step record, or replace the one with the same identity
    async fn append_or_update_step(
        &self,
        workflow_id: &str,
        record: &StepRecord,
    ) -> Result<(), RunError>;

    /// All step records of a workflow in `(superstep, index)` order
    async fn load_steps(&self, workflow_id: &str) -> Result<Vec<StepRecord>, RunError>;

    /// Newest value of every name, with its version
    async fn load_latest_values(
        &self,
        workflow_id: &str,
    ) -> Result<HashMap<String, VersionedValue>, RunError> {
        let inputs = self
            .load_workflow(workflow_id)
            .await?
            .map(|w| w.inputs)
            .unwrap_or_default();
        let steps = self.load_steps(workflow_id).await?;
        Ok(fold_latest_values(&inputs, &steps))
    }

    /// Workflow envelope, if the workflow exists
    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, RunError>;

    /// Create or replace a workflow envelope
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), RunError>;

    /// Ids of every stored workflow, sorted
    async fn list_workflows(&self) -> Result<Vec<String>, RunError>;

    /// Remove a workflow and its steps
    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), RunError>;
}

/// Shared durability handle
pub type SharedStepStore = Arc<dyn StepStore>;

/// Sort records into replay order and replace any record sharing an
/// identity with `record`
pub(crate) fn upsert_record(records: &mut Vec<StepRecord>, record: &StepRecord) {
    match records
        .iter_mut()
        .find(|r| r.superstep == record.superstep && r.node == record.node)
    {
        Some(existing) => *existing = record.clone(),
        None => {
            records.push(record.clone());
            records.sort_by_key(StepRecord::position);
        }
    }
}

/// Configuration for creating step stores.
///
/// Use with [`create_store`] to instantiate the appropriate backend.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// In-memory store (not durable across processes)
    #[default]
    Memory,

    /// One file per workflow
    File {
        /// Directory holding workflow files
        path: PathBuf,
        /// Whether to compress workflow files (uses zstd)
        compression: bool,
    },
}

/// In-memory step store.
///
/// Survives across runs within one process, which is enough to exercise
/// resume and crash recovery in tests.
#[derive(Debug, Default)]
pub struct MemoryStepStore {
    workflows: tokio::sync::RwLock<HashMap<String, WorkflowRecord>>,
    steps: tokio::sync::RwLock<HashMap<String, Vec<StepRecord>>>,
}

impl MemoryStepStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn append_or_update_step(
        &self,
        workflow_id: &str,
        record: &StepRecord,
    ) -> Result<(), RunError> {
        let mut steps = self.steps.write().await;
        upsert_record(steps.entry(workflow_id.to_string()).or_default(), record);
        Ok(())
    }

    async fn load_steps(&self, workflow_id: &str) -> Result<Vec<StepRecord>, RunError> {
        let steps = self.steps.read().await;
        Ok(steps.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, RunError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(workflow_id).cloned())
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), RunError> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<String>, RunError> {
        let workflows = self.workflows.read().await;
        let mut ids: Vec<String> = workflows.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), RunError> {
        self.workflows.write().await.remove(workflow_id);
        self.steps.write().await.remove(workflow_id);
        Ok(())
    }
}

/// Create a step store from configuration.
///
/// # Example
///
/// ```ignore
/// let store = create_store(StoreConfig::File {
///     path: PathBuf::from("./workflows"),
///     compression: false,
/// });
/// ```
pub fn create_store(config: StoreConfig) -> SharedStepStore {
    match config {
        StoreConfig::Memory => Arc::new(MemoryStepStore::new()),
        StoreConfig::File { path, compression } => Arc::new(FileStepStore::new(path, compression)),
    }
}
