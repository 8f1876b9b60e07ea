//! Superstep runtime for dataflow workflow graphs
//!
//! This module executes graphs built in [`crate::workflow`]. Key concepts:
//!
//! - **Superstep**: one synchronized round in which every stale, eligible
//!   node runs once against a frozen view of the state
//! - **Versioned state**: every name carries a monotonically increasing
//!   version; staleness compares consumed versions with current ones
//! - **Step log**: the durable record of every node execution, and the only
//!   cursor a resumed workflow needs
//! - **Interrupt**: a node that halts the run until an external party
//!   supplies a response
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐                      │
//! │  │Superstep│→ │Superstep│→ │Superstep│→ ...                 │
//! │  │    0    │  │    1    │  │    2    │                      │
//! │  └─────────┘  └─────────┘  └─────────┘                      │
//! │       │            │            │                            │
//! │       ▼            ▼            ▼                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Per-Superstep: Select → Check → Execute → Commit    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │       │                                     │                │
//! │       ▼                                     ▼                │
//! │  StateStore (versions)              StepLog → StepStore      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod checkpoint;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod result;
pub mod routing;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod step;
pub mod visualization;

// Re-exports
pub use cache::{cache_key, InMemoryCache, NodeCache};
pub use checkpoint::{
    create_store, FileStepStore, MemoryStepStore, OpenRound, SharedStepStore, StepStore,
    StoreConfig, WorkflowRecord, WorkflowStatus,
};
pub use concurrency::{ConcurrencyController, Permit};
pub use config::{RunConfig, DEFAULT_MAX_ITERATIONS};
pub use context::{NodeContext, StopSignal};
pub use error::RunError;
pub use events::{ChannelSink, CollectingSink, Event, EventEmitter, EventKind, EventSink, TracingSink};
pub use interrupt::{FreshResponse, PauseInfo};
pub use result::{ResultValue, RunResult, RunStatus, Selection};
pub use routing::RoutingTable;
pub use runner::{AsyncRunner, RunnerCapabilities, SyncRunner};
pub use runtime::RunOptions;
pub use state::{InputVersions, StateStore, Version, VersionedValue};
pub use step::{StepLog, StepRecord, StepStatus};
