//! Superstep scheduler - core execution engine for workflow graphs
//!
//! A run is a sequence of synchronized supersteps. Each superstep follows
//! the sequence: Select → Check → Execute → Commit.
//!
//! - **Select**: every node whose required inputs are present, whose
//!   routing allows it, and whose input versions were never consumed by a
//!   completed step record becomes a candidate.
//! - **Check**: two candidates declaring the same output abort the run.
//! - **Execute**: suspendable candidates are gathered concurrently under the
//!   shared permit pool, then immediate candidates run one after another.
//! - **Commit**: outcomes are applied in alphabetical order, each producing
//!   exactly one step record written through to the durability port.
//!
//! The run ends when a round has no candidates (completed), a node fails,
//! an interrupt pauses, a stop is requested, or the iteration limit is hit.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::cache::{cache_key, NodeCache};
use super::checkpoint::{OpenRound, SharedStepStore, WorkflowRecord, WorkflowStatus};
use super::concurrency::ConcurrencyController;
use super::config::RunConfig;
use super::context::{NodeContext, RunEnv, StopSignal};
use super::error::RunError;
use super::events::{Event, EventEmitter, EventKind, EventSink, TracingSink};
use super::interrupt::{awaited_responses, fresh_response, FreshResponse, PauseInfo};
use super::result::{RunResult, RunStatus, Selection};
use super::routing::validate_decision;
use super::state::{InputVersions, StateStore, Version, VersionedValue};
use super::step::{StepLog, StepRecord, StepStatus};
use crate::workflow::graph::{Graph, GraphEntry};
use crate::workflow::node::{NodeInputs, NodeKind, NodeOutput, RouteDecision, ValueStream};

/// Per-call options shared by both runners
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Durable workflow identity; requires a store
    pub workflow_id: Option<String>,
    /// Which values the result exposes
    pub select: Selection,
    pub config: RunConfig,
    /// Stop handle; a fresh one is created when absent
    pub stop: Option<StopSignal>,
    pub store: Option<SharedStepStore>,
    pub cache: Option<Arc<dyn NodeCache>>,
    /// Extra sinks; a [`TracingSink`] is always registered
    pub sinks: Vec<Arc<dyn EventSink>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_select(mut self, select: Selection) -> Self {
        self.select = select;
        self
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.config = self.config.with_max_concurrency(max);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.config = self.config.with_max_iterations(max);
        self
    }

    pub fn with_force_resume(mut self, force: bool) -> Self {
        self.config = self.config.with_force_resume(force);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_store(mut self, store: SharedStepStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn NodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Resources for one top-level call
    pub(crate) fn env(&self) -> RunEnv {
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        sinks.extend(self.sinks.iter().cloned());
        RunEnv {
            config: self.config.clone(),
            concurrency: ConcurrencyController::new(self.config.max_concurrency),
            emitter: EventEmitter::new(sinks),
            stop: self.stop.clone().unwrap_or_default(),
            store: self.store.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("workflow_id", &self.workflow_id)
            .field("select", &self.select)
            .field("config", &self.config)
            .field("durable", &self.store.is_some())
            .field("cached", &self.cache.is_some())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Run `graph` as a top-level call and flush sinks afterwards
pub(crate) async fn execute_graph(
    graph: &Graph,
    values: BTreeMap<String, Value>,
    options: &RunOptions,
) -> RunResult {
    let env = options.env();
    let result = Scheduler::new(
        graph,
        env.clone(),
        options.workflow_id.clone(),
        None,
        options.select.clone(),
    )
    .run(values)
    .await;
    env.emitter.flush(env.config.sink_flush_timeout).await;
    result
}

/// Mutable state of one run
struct RunState {
    state: StateStore,
    log: StepLog,
    workflow: Option<WorkflowRecord>,
}

/// How a run ended
enum RunOutcome {
    Completed,
    Paused(PauseInfo),
    Stopped,
    Failed(RunError),
}

/// Node selected for the current round
struct Candidate {
    name: String,
    versions: InputVersions,
}

/// Everything a node execution needs, owned so it can move into a task
struct Prepared {
    entry: GraphEntry,
    inputs: NodeInputs,
    versions: InputVersions,
    index: usize,
    ctx: NodeContext,
    fresh: Option<FreshResponse>,
}

/// Raw outcome of one node execution, committed later
struct Executed {
    name: String,
    span_id: String,
    superstep: usize,
    index: usize,
    versions: InputVersions,
    started_at: DateTime<Utc>,
    result: anyhow::Result<Produced>,
}

enum Produced {
    Values {
        values: BTreeMap<String, Value>,
        cached: bool,
        partial: bool,
    },
    Route(RouteDecision),
    Pause(PauseInfo),
    Response(FreshResponse),
    Nested(Box<RunResult>),
}

enum Committed {
    Done,
    Truncated,
    Paused(PauseInfo),
    Failed(RunError),
}

/// Drives one graph run, top-level or nested
pub(crate) struct Scheduler {
    graph: Graph,
    env: RunEnv,
    run_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    workflow_id: Option<String>,
    selection: Selection,
}

impl Scheduler {
    pub(crate) fn new(
        graph: &Graph,
        env: RunEnv,
        workflow_id: Option<String>,
        parent_span_id: Option<String>,
        selection: Selection,
    ) -> Self {
        Self {
            graph: graph.clone(),
            env,
            run_id: uuid::Uuid::new_v4().to_string(),
            span_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id,
            workflow_id,
            selection,
        }
    }

    /// Run to completion, pause, stop or failure
    pub(crate) async fn run(self, values: BTreeMap<String, Value>) -> RunResult {
        self.emit_run(EventKind::RunStarted {
            workflow_id: self.workflow_id.clone(),
            graph: self.graph.name().to_string(),
        });

        let mut supersteps = 0;
        let (outcome, run) = match self.restore(values).await {
            Ok(mut run) => {
                let outcome = match self.preflight(&run.state) {
                    Ok(()) => self.drive(&mut run, &mut supersteps).await,
                    Err(error) => RunOutcome::Failed(error),
                };
                (outcome, Some(run))
            }
            Err(error) => (RunOutcome::Failed(error), None),
        };

        let (mut status, pause, mut error) = match outcome {
            RunOutcome::Completed => (RunStatus::Completed, None, None),
            RunOutcome::Paused(info) => (RunStatus::Paused, Some(info), None),
            RunOutcome::Stopped => (RunStatus::Stopped, None, None),
            RunOutcome::Failed(error) => (RunStatus::Failed, None, Some(error)),
        };

        let empty = StateStore::new();
        let (state, nested) = match run {
            Some(mut run) => {
                if let Err(e) = self.save_status(&mut run, status).await {
                    status = RunStatus::Failed;
                    error.get_or_insert(e);
                }
                let nested = self.nested_results(&run.log);
                (run.state, nested)
            }
            None => (empty, BTreeMap::new()),
        };

        let mut result = RunResult::new(self.run_id.clone(), self.workflow_id.clone(), status)
            .with_values(&state, &self.selection, self.graph.leaf_outputs(), nested);
        result.pause = if status == RunStatus::Paused { pause } else { None };
        result.error = error;
        result.supersteps = supersteps;

        self.emit_run(EventKind::RunFinished {
            status,
            error: result.error.as_ref().map(|e| e.to_string()),
            supersteps,
        });
        result
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Load prior progress and apply caller inputs
    async fn restore(&self, values: BTreeMap<String, Value>) -> Result<RunState, RunError> {
        let mut run = match (&self.workflow_id, &self.env.store) {
            (Some(id), Some(store)) => {
                let mut record = match store.load_workflow(id).await? {
                    Some(record) => record,
                    None => WorkflowRecord::new(id.clone(), self.graph.hash()),
                };
                if record.graph_hash != self.graph.hash() {
                    if !self.env.config.force_resume {
                        return Err(RunError::version_mismatch(
                            id.clone(),
                            record.graph_hash.clone(),
                            self.graph.hash(),
                        ));
                    }
                    warn!(
                        workflow_id = %id,
                        expected = %record.graph_hash,
                        found = %self.graph.hash(),
                        "Graph definition changed; resuming anyway"
                    );
                    record.graph_hash = self.graph.hash().to_string();
                }

                let steps = store.load_steps(id).await?;
                let latest = store.load_latest_values(id).await?;
                if !steps.is_empty() {
                    info!(workflow_id = %id, steps = steps.len(), "Resuming workflow");
                }
                RunState {
                    state: StateStore::from_versioned(latest),
                    log: StepLog::durable(id.clone(), Arc::clone(store), steps),
                    workflow: Some(record),
                }
            }
            (Some(id), None) => {
                return Err(RunError::storage(format!(
                    "workflow '{}' requested but no step store configured",
                    id
                )))
            }
            (None, _) => RunState {
                state: StateStore::new(),
                log: StepLog::ephemeral(),
                workflow: None,
            },
        };

        let awaiting = awaited_responses(self.graph.nodes().map(GraphEntry::name), &run.log);
        let persist_inputs = self.env.config.persist_inputs;
        for (name, value) in values {
            // an answer to a pending pause is always new, even when it repeats the last one
            let answer = awaiting.contains(&name);
            match run.workflow.as_mut() {
                Some(record) if persist_inputs => {
                    // resupplying the same value is a no-op so resumes stay idempotent
                    let unchanged =
                        record.inputs.get(&name).map(|v| v.value == value).unwrap_or(false);
                    if unchanged && !answer {
                        continue;
                    }
                    let version = run.state.set(name.clone(), value.clone());
                    record.inputs.insert(name, VersionedValue::new(value, version));
                }
                _ if answer => {
                    run.state.set(name, value);
                }
                _ => {
                    run.state.set_input(name, value);
                }
            }
        }

        if let (Some(record), Some(store)) = (run.workflow.as_mut(), &self.env.store) {
            record.set_status(WorkflowStatus::Active);
            store.save_workflow(record).await?;
        }
        Ok(run)
    }

    /// Fail fast when a required input can never become available
    fn preflight(&self, state: &StateStore) -> Result<(), RunError> {
        for entry in self.graph.nodes() {
            let missing: Vec<String> = entry
                .node
                .inputs()
                .iter()
                .filter(|name| !state.contains(name) && !self.graph.is_produced(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RunError::missing_input(entry.name(), missing));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Superstep loop
    // =========================================================================

    async fn drive(&self, run: &mut RunState, supersteps: &mut usize) -> RunOutcome {
        let max_iterations = self.env.config.max_iterations;
        let mut unfinished = run.workflow.as_ref().and_then(|w| w.open_round.clone());
        loop {
            let next = run.log.next_superstep();
            if self.env.stop.is_stopped() {
                self.emit_run(EventKind::StopRequested { superstep: next });
                return RunOutcome::Stopped;
            }

            let candidates = self.select_candidates(run);
            if candidates.is_empty() {
                return RunOutcome::Completed;
            }
            if *supersteps >= max_iterations {
                return RunOutcome::Failed(RunError::cycle_runaway(max_iterations));
            }

            // a round cut short by a crash, failure or stop keeps its positions
            let round = match unfinished.take() {
                Some(open) if resumes(&open, &candidates, &run.log) => {
                    info!(
                        run_id = %self.run_id,
                        superstep = open.superstep,
                        remaining = candidates.len(),
                        "Re-entering unfinished superstep"
                    );
                    open
                }
                _ => OpenRound::new(next, candidates.iter().map(|c| c.name.clone()).collect()),
            };
            if let Err(error) = self.check_conflicts(&candidates, round.superstep) {
                return RunOutcome::Failed(error);
            }
            if let Err(error) = self.open_round(run, &round).await {
                return RunOutcome::Failed(error);
            }

            *supersteps += 1;
            self.emit_run(EventKind::SuperstepStarted {
                superstep: round.superstep,
                candidates: candidates.iter().map(|c| c.name.clone()).collect(),
            });

            if let Some(outcome) = self.execute_round(run, &round, candidates).await {
                return outcome;
            }
        }
    }

    /// Note the round on the workflow envelope before any of it executes
    async fn open_round(&self, run: &mut RunState, round: &OpenRound) -> Result<(), RunError> {
        if let (Some(record), Some(store)) = (run.workflow.as_mut(), &self.env.store) {
            if record.open_round.as_ref() != Some(round) {
                record.open_round = Some(round.clone());
                store.save_workflow(record).await?;
            }
        }
        Ok(())
    }

    /// Stale, eligible nodes with all required inputs present, by name
    fn select_candidates(&self, run: &RunState) -> Vec<Candidate> {
        self.graph
            .nodes()
            .filter_map(|entry| {
                let name = entry.name();
                if !run.state.contains_all(entry.node.inputs()) {
                    return None;
                }
                if !self.graph.routing().is_eligible(name, &run.log) {
                    return None;
                }
                let versions = run.state.versions_of(entry.node.inputs());
                let stale = run.log.is_stale(name, &versions) || outputs_lost(entry, run);
                stale.then(|| Candidate {
                    name: name.to_string(),
                    versions,
                })
            })
            .collect()
    }

    fn check_conflicts(&self, candidates: &[Candidate], superstep: usize) -> Result<(), RunError> {
        let active: BTreeSet<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        for output in self.graph.produced() {
            let producers: Vec<String> = self
                .graph
                .producers_of(output)
                .iter()
                .filter(|p| active.contains(p.as_str()))
                .cloned()
                .collect();
            if producers.len() > 1 {
                return Err(RunError::conflict(output.as_str(), superstep, producers));
            }
        }
        Ok(())
    }

    /// Execute one round. `None` means keep going.
    async fn execute_round(
        &self,
        run: &mut RunState,
        round: &OpenRound,
        candidates: Vec<Candidate>,
    ) -> Option<RunOutcome> {
        let mut suspendable = Vec::new();
        let mut immediate = Vec::new();
        for (position, candidate) in candidates.into_iter().enumerate() {
            let index = round.index_of(&candidate.name).unwrap_or(position);
            let Some(prepared) = self.prepare(run, round.superstep, index, candidate) else {
                continue;
            };
            if prepared.entry.capabilities.suspendable {
                suspendable.push(prepared);
            } else {
                immediate.push(prepared);
            }
        }

        let mut executed = Vec::new();

        // dropping the set aborts whatever is still running
        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<String, Executed> = BTreeMap::new();
        for prepared in suspendable {
            let meta = Executed::pending(&prepared);
            pending.insert(meta.name.clone(), meta);
            tasks.spawn(execute(prepared));
        }
        let mut lost = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    pending.remove(&done.name);
                    executed.push(done);
                }
                Err(e) => lost.push(e.to_string()),
            }
        }
        for meta in pending.into_values() {
            let reason = lost.join("; ");
            executed.push(meta.with_error(anyhow::anyhow!("node task aborted: {}", reason)));
        }

        for prepared in immediate {
            executed.push(execute(prepared).await);
        }

        executed.sort_by(|a, b| a.name.cmp(&b.name));

        let mut failure = None;
        let mut pause = None;
        let mut truncated = false;
        for done in executed {
            let committed = match self.commit(run, done).await {
                Ok(committed) => committed,
                Err(error) => Committed::Failed(error),
            };
            match committed {
                Committed::Done => {}
                Committed::Truncated => truncated = true,
                Committed::Paused(info) => {
                    pause.get_or_insert(info);
                }
                Committed::Failed(error) => {
                    failure.get_or_insert(error);
                }
            }
        }

        if let Some(error) = failure {
            return Some(RunOutcome::Failed(error));
        }
        if let Some(info) = pause {
            return Some(RunOutcome::Paused(info));
        }
        if truncated || self.env.stop.is_stopped() {
            self.emit_run(EventKind::StopRequested {
                superstep: round.superstep,
            });
            return Some(RunOutcome::Stopped);
        }
        None
    }

    fn prepare(
        &self,
        run: &RunState,
        superstep: usize,
        index: usize,
        candidate: Candidate,
    ) -> Option<Prepared> {
        let entry = self.graph.node(&candidate.name)?.clone();

        // a paused node resumes under its original identity
        let (superstep, index) = match run.log.latest(&candidate.name) {
            Some(record) if record.status == StepStatus::Paused => (record.superstep, record.index),
            _ => (superstep, index),
        };

        let inputs = NodeInputs::new(
            run.state
                .values_of(entry.node.inputs().iter().chain(entry.node.optional_inputs())),
        );
        let fresh = match &entry.kind {
            NodeKind::Interrupt(spec) => {
                fresh_response(&candidate.name, spec, &run.state, &run.log)
            }
            _ => None,
        };
        let ctx = NodeContext {
            env: self.env.clone(),
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            node: candidate.name,
            span_id: uuid::Uuid::new_v4().to_string(),
            run_span_id: self.span_id.clone(),
            superstep,
        };

        Some(Prepared {
            entry,
            inputs,
            versions: candidate.versions,
            index,
            ctx,
            fresh,
        })
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Apply one outcome and record it
    async fn commit(&self, run: &mut RunState, done: Executed) -> Result<Committed, RunError> {
        let Executed {
            name,
            span_id,
            superstep,
            index,
            versions,
            started_at,
            result,
        } = done;
        let Some(entry) = self.graph.node(&name) else {
            return Err(RunError::internal(format!("executed unknown node '{}'", name)));
        };

        let mut record =
            StepRecord::begin(self.workflow_id.clone(), superstep, &name, index, versions);
        record.started_at = started_at;

        let produced = match result {
            Ok(produced) => produced,
            Err(e) => {
                let error = RunError::node_failure(&name, &e);
                return self.fail(run, record, &span_id, error).await;
            }
        };

        match produced {
            Produced::Values {
                values,
                cached,
                partial,
            } => {
                if entry.kind.is_gate() {
                    let error = RunError::NodeFailure {
                        node: name.clone(),
                        message: "gate returned values instead of a routing decision".into(),
                    };
                    return self.fail(run, record, &span_id, error).await;
                }
                if let Some(undeclared) = values.keys().find(|k| !entry.node.outputs().contains(*k))
                {
                    let error = RunError::NodeFailure {
                        node: name.clone(),
                        message: format!("produced undeclared output '{}'", undeclared),
                    };
                    return self.fail(run, record, &span_id, error).await;
                }

                self.write_outputs(run, &mut record, &values, entry.capabilities.persist);
                record.cached = cached;
                record.partial = partial;
                record.finish(if partial {
                    StepStatus::Stopped
                } else {
                    StepStatus::Completed
                });
                run.log.upsert(record).await?;

                self.emit_node(
                    &span_id,
                    EventKind::NodeFinished {
                        node: name,
                        superstep,
                        outputs: values.into_keys().collect(),
                        cached,
                        partial,
                    },
                );
                Ok(if partial {
                    Committed::Truncated
                } else {
                    Committed::Done
                })
            }

            Produced::Route(decision) => {
                let NodeKind::Gate(spec) = &entry.kind else {
                    let error = RunError::NodeFailure {
                        node: name.clone(),
                        message: "only gates may return a routing decision".into(),
                    };
                    return self.fail(run, record, &span_id, error).await;
                };
                if let Err(error) = validate_decision(&name, spec, &decision) {
                    return self.fail(run, record, &span_id, error).await;
                }

                let targets = decision.labels();
                record.decision = Some(decision);
                record.finish(StepStatus::Completed);
                run.log.upsert(record).await?;

                self.emit_node(
                    &span_id,
                    EventKind::RouteDecided {
                        gate: name.clone(),
                        superstep,
                        targets,
                    },
                );
                self.emit_node(
                    &span_id,
                    EventKind::NodeFinished {
                        node: name,
                        superstep,
                        outputs: Vec::new(),
                        cached: false,
                        partial: false,
                    },
                );
                Ok(Committed::Done)
            }

            Produced::Pause(info) => self.pause(run, record, &span_id, info, None).await,

            Produced::Response(fresh) => {
                let NodeKind::Interrupt(spec) = &entry.kind else {
                    return Err(RunError::internal(format!(
                        "'{}' received a response but is not an interrupt",
                        name
                    )));
                };
                record
                    .output_versions
                    .insert(spec.response.clone(), fresh.version);
                record.finish(StepStatus::Completed);
                run.log.upsert(record).await?;

                info!(node = %name, version = fresh.version, "Interrupt answered");
                self.emit_node(
                    &span_id,
                    EventKind::NodeFinished {
                        node: name,
                        superstep,
                        outputs: vec![spec.response.clone()],
                        cached: false,
                        partial: false,
                    },
                );
                Ok(Committed::Done)
            }

            Produced::Nested(result) => self.commit_nested(run, entry, record, &span_id, *result).await,
        }
    }

    async fn commit_nested(
        &self,
        run: &mut RunState,
        entry: &GraphEntry,
        mut record: StepRecord,
        span_id: &str,
        result: RunResult,
    ) -> Result<Committed, RunError> {
        let name = entry.name().to_string();
        let superstep = record.superstep;

        match result.status {
            RunStatus::Completed => {
                let values: BTreeMap<String, Value> = entry
                    .node
                    .outputs()
                    .iter()
                    .filter_map(|o| result.get(o).map(|v| (o.clone(), v.clone())))
                    .collect();
                self.write_outputs(run, &mut record, &values, entry.capabilities.persist);
                record.nested = Some(Box::new(result));
                record.finish(StepStatus::Completed);
                run.log.upsert(record).await?;

                self.emit_node(
                    span_id,
                    EventKind::NodeFinished {
                        node: name,
                        superstep,
                        outputs: values.into_keys().collect(),
                        cached: false,
                        partial: false,
                    },
                );
                Ok(Committed::Done)
            }
            RunStatus::Paused => {
                let Some(info) = result.pause.clone() else {
                    return Err(RunError::internal(format!(
                        "nested run of '{}' paused without pause info",
                        name
                    )));
                };
                let info = info.nested_under(&name);
                self.pause(run, record, span_id, info, Some(result)).await
            }
            RunStatus::Stopped => {
                record.nested = Some(Box::new(result));
                record.finish(StepStatus::Stopped);
                run.log.upsert(record).await?;
                Ok(Committed::Truncated)
            }
            RunStatus::Failed => {
                let message = result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "nested run failed".to_string());
                record.nested = Some(Box::new(result));
                let error = RunError::NodeFailure {
                    node: name,
                    message,
                };
                self.fail(run, record, span_id, error).await
            }
        }
    }

    async fn pause(
        &self,
        run: &mut RunState,
        mut record: StepRecord,
        span_id: &str,
        info: PauseInfo,
        nested: Option<RunResult>,
    ) -> Result<Committed, RunError> {
        record.pause = Some(info.clone());
        record.nested = nested.map(Box::new);
        record.finish(StepStatus::Paused);
        run.log.upsert(record).await?;

        self.emit_node(
            span_id,
            EventKind::Paused {
                node: info.node.clone(),
                path: info.path.clone(),
                response_key: info.response_key.clone(),
            },
        );
        Ok(Committed::Paused(info))
    }

    async fn fail(
        &self,
        run: &mut RunState,
        mut record: StepRecord,
        span_id: &str,
        error: RunError,
    ) -> Result<Committed, RunError> {
        let message = match &error {
            RunError::NodeFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        record.error = Some(message.clone());
        record.finish(StepStatus::Failed);
        self.emit_node(
            span_id,
            EventKind::NodeFailed {
                node: record.node.clone(),
                superstep: record.superstep,
                error: message,
            },
        );
        run.log.upsert(record).await?;
        Ok(Committed::Failed(error))
    }

    /// Commit values to state and note their versions on `record`
    fn write_outputs(
        &self,
        run: &mut RunState,
        record: &mut StepRecord,
        values: &BTreeMap<String, Value>,
        persist: bool,
    ) {
        for (name, value) in values {
            let version = write_value(run, name, value.clone());
            record.output_versions.insert(name.clone(), version);
        }
        if persist {
            record.outputs = Some(values.clone());
        }
    }

    // =========================================================================
    // Finish
    // =========================================================================

    async fn save_status(&self, run: &mut RunState, status: RunStatus) -> Result<(), RunError> {
        if let (Some(record), Some(store)) = (run.workflow.as_mut(), &self.env.store) {
            if status == RunStatus::Completed {
                record.open_round = None;
            }
            record.set_status(match status {
                RunStatus::Completed => WorkflowStatus::Completed,
                RunStatus::Failed => WorkflowStatus::Failed,
                RunStatus::Paused | RunStatus::Stopped => WorkflowStatus::Active,
            });
            store.save_workflow(record).await?;
        }
        Ok(())
    }

    /// Latest nested result of every container node
    fn nested_results(&self, log: &StepLog) -> BTreeMap<String, RunResult> {
        self.graph
            .nodes()
            .filter(|e| e.kind.is_graph())
            .filter_map(|e| {
                let nested = log.latest(e.name())?.nested.as_ref()?;
                Some((e.name().to_string(), (**nested).clone()))
            })
            .collect()
    }

    fn emit_run(&self, kind: EventKind) {
        self.env.emitter.emit(Event::new(
            self.run_id.clone(),
            self.span_id.clone(),
            self.parent_span_id.clone(),
            kind,
        ));
    }

    fn emit_node(&self, span_id: &str, kind: EventKind) {
        self.env.emitter.emit(Event::new(
            self.run_id.clone(),
            span_id,
            Some(self.span_id.clone()),
            kind,
        ));
    }
}

/// A non-persisted node must re-run once its outputs are gone from state
/// Whether `candidates` are exactly what `open` left unfinished
fn resumes(open: &OpenRound, candidates: &[Candidate], log: &StepLog) -> bool {
    candidates.iter().all(|candidate| {
        open.index_of(&candidate.name).is_some()
            && !log
                .history(&candidate.name)
                .any(|r| r.superstep == open.superstep && r.is_completed())
    })
}

fn outputs_lost(entry: &GraphEntry, run: &RunState) -> bool {
    if entry.capabilities.persist {
        return false;
    }
    run.log
        .latest_completed(entry.name())
        .map(|r| r.output_versions.keys().any(|n| !run.state.contains(n)))
        .unwrap_or(false)
}

/// Store `value`, never reusing a version an earlier record committed
fn write_value(run: &mut RunState, name: &str, value: Value) -> Version {
    if !run.state.contains(name) {
        let floor = run.log.max_output_version(name);
        if floor > 0 {
            run.state.restore(name, value, floor + 1);
            return floor + 1;
        }
    }
    run.state.set(name, value)
}

impl Executed {
    fn pending(prepared: &Prepared) -> Self {
        Self {
            name: prepared.ctx.node.clone(),
            span_id: prepared.ctx.span_id.clone(),
            superstep: prepared.ctx.superstep,
            index: prepared.index,
            versions: prepared.versions.clone(),
            started_at: Utc::now(),
            result: Ok(Produced::Values {
                values: BTreeMap::new(),
                cached: false,
                partial: false,
            }),
        }
    }

    fn with_error(mut self, error: anyhow::Error) -> Self {
        self.result = Err(error);
        self
    }
}

// =============================================================================
// Node execution
// =============================================================================

async fn execute(prepared: Prepared) -> Executed {
    let started_at = Utc::now();
    let Prepared {
        entry,
        inputs,
        versions,
        index,
        ctx,
        fresh,
    } = prepared;

    ctx.emit(EventKind::NodeStarted {
        node: ctx.node.clone(),
        superstep: ctx.superstep,
    });
    let result = run_body(&entry, inputs, &ctx, fresh).await;

    Executed {
        name: ctx.node.clone(),
        span_id: ctx.span_id.clone(),
        superstep: ctx.superstep,
        index,
        versions,
        started_at,
        result,
    }
}

async fn run_body(
    entry: &GraphEntry,
    inputs: NodeInputs,
    ctx: &NodeContext,
    fresh: Option<FreshResponse>,
) -> anyhow::Result<Produced> {
    if let Some(fresh) = fresh {
        return Ok(Produced::Response(fresh));
    }

    let cache = match (&ctx.env.cache, entry.capabilities.cacheable) {
        (Some(cache), true) => Some((
            Arc::clone(cache),
            cache_key(&entry.node.signature(), inputs.as_map()),
        )),
        _ => None,
    };
    if let Some((cache, key)) = &cache {
        if let Some(values) = cache.get(key).await {
            ctx.emit(EventKind::CacheHit {
                node: ctx.node.clone(),
            });
            return Ok(Produced::Values {
                values,
                cached: true,
                partial: false,
            });
        }
    }

    // containers hold no permit; their children take their own
    let _permit = if entry.capabilities.suspendable && !entry.kind.is_graph() {
        Some(ctx.env.concurrency.acquire().await?)
    } else {
        None
    };

    let produced = match entry.node.invoke(inputs, ctx).await? {
        NodeOutput::Values(values) => Produced::Values {
            values,
            cached: false,
            partial: false,
        },
        NodeOutput::Route(decision) => Produced::Route(decision),
        NodeOutput::Stream { output, stream } => fold_stream(ctx, output, stream).await?,
        NodeOutput::Pause(info) => Produced::Pause(info),
        NodeOutput::Nested(result) => Produced::Nested(result),
    };

    if let (
        Some((cache, key)),
        Produced::Values {
            values,
            partial: false,
            ..
        },
    ) = (&cache, &produced)
    {
        cache.put(key, values.clone()).await;
    }
    Ok(produced)
}

/// Collect stream elements into one array, stopping early on request
async fn fold_stream(
    ctx: &NodeContext,
    output: String,
    mut stream: ValueStream,
) -> anyhow::Result<Produced> {
    let mut items = Vec::new();
    let mut partial = false;
    loop {
        tokio::select! {
            biased;
            _ = ctx.env.stop.stopped() => {
                partial = true;
                break;
            }
            next = stream.next() => match next {
                Some(Ok(item)) => {
                    ctx.emit(EventKind::StreamChunk {
                        node: ctx.node.clone(),
                        index: items.len(),
                        value: item.clone(),
                    });
                    items.push(item);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
    }

    if partial {
        warn!(node = %ctx.node, items = items.len(), "Stream truncated by stop request");
    }
    let mut values = BTreeMap::new();
    values.insert(output, Value::Array(items));
    Ok(Produced::Values {
        values,
        cached: false,
        partial,
    })
}
