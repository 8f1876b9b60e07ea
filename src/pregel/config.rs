//! Runtime configuration
//!
//! `RunConfig` holds the serialisable knobs of a run: concurrency ceiling,
//! cycle guard, sink flush timeout and resume policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default superstep ceiling before a run fails with `CycleRunaway`
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum suspendable node bodies in flight across the whole run
    /// (nested graphs and batch items included). `None` = unlimited.
    pub max_concurrency: Option<usize>,

    /// Maximum supersteps executed by a single `run` call
    pub max_iterations: usize,

    /// Upper bound on waiting for event sinks to flush at run end
    #[serde(with = "humantime_serde")]
    pub sink_flush_timeout: Duration,

    /// Resume even if the stored graph hash differs from the current graph
    pub force_resume: bool,

    /// Store caller-supplied values on the workflow envelope
    pub persist_inputs: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            sink_flush_timeout: Duration::from_secs(5),
            force_resume: false,
            persist_inputs: true,
        }
    }
}

impl RunConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound concurrent suspendable work
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }

    /// Remove the concurrency bound
    pub fn unbounded(mut self) -> Self {
        self.max_concurrency = None;
        self
    }

    /// Set the superstep ceiling
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the sink flush timeout
    pub fn with_sink_flush_timeout(mut self, timeout: Duration) -> Self {
        self.sink_flush_timeout = timeout;
        self
    }

    /// Allow resuming a workflow whose graph hash changed
    pub fn with_force_resume(mut self, force: bool) -> Self {
        self.force_resume = force;
        self
    }

    /// Enable or disable persisting caller inputs on the workflow envelope
    pub fn with_persist_inputs(mut self, persist: bool) -> Self {
        self.persist_inputs = persist;
        self
    }
}
