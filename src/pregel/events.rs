//! Lifecycle events
//!
//! Every state transition of a run produces an immutable [`Event`]. Events
//! are pushed to every registered [`EventSink`] without waiting on them; the
//! scheduler never reads anything back. Span ids form a tree: a run span is
//! the parent of its node spans, and a container node span is the parent of
//! the nested run span.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::result::RunStatus;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        workflow_id: Option<String>,
        graph: String,
    },
    RunFinished {
        status: RunStatus,
        error: Option<String>,
        supersteps: usize,
    },
    SuperstepStarted {
        superstep: usize,
        candidates: Vec<String>,
    },
    NodeStarted {
        node: String,
        superstep: usize,
    },
    NodeFinished {
        node: String,
        superstep: usize,
        outputs: Vec<String>,
        cached: bool,
        partial: bool,
    },
    NodeFailed {
        node: String,
        superstep: usize,
        error: String,
    },
    RouteDecided {
        gate: String,
        superstep: usize,
        targets: Vec<String>,
    },
    Paused {
        node: String,
        path: String,
        response_key: String,
    },
    StopRequested {
        superstep: usize,
    },
    StreamChunk {
        node: String,
        index: usize,
        value: Value,
    },
    CacheHit {
        node: String,
    },
}

impl EventKind {
    /// Snake-case name of the variant
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::RunFinished { .. } => "run_finished",
            EventKind::SuperstepStarted { .. } => "superstep_started",
            EventKind::NodeStarted { .. } => "node_started",
            EventKind::NodeFinished { .. } => "node_finished",
            EventKind::NodeFailed { .. } => "node_failed",
            EventKind::RouteDecided { .. } => "route_decided",
            EventKind::Paused { .. } => "paused",
            EventKind::StopRequested { .. } => "stop_requested",
            EventKind::StreamChunk { .. } => "stream_chunk",
            EventKind::CacheHit { .. } => "cache_hit",
        }
    }
}

/// An immutable lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    /// Execution this event belongs to (run span or node span)
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(
        run_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            span_id: span_id.into(),
            parent_span_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Consumer of lifecycle events.
///
/// `on_event` must not block; buffering sinks do their slow work in `flush`.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);

    /// Called once when a top-level run ends
    async fn flush(&self) {}
}

/// Fans events out to every registered sink
#[derive(Clone, Default)]
pub struct EventEmitter {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventEmitter {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver `event` to every sink
    pub fn emit(&self, event: Event) {
        for sink in self.sinks.iter() {
            sink.on_event(&event);
        }
    }

    /// Flush all sinks, giving up after `timeout`
    pub async fn flush(&self, timeout: Duration) {
        if self.sinks.is_empty() {
            return;
        }
        let flushes = futures::future::join_all(self.sinks.iter().map(|s| s.flush()));
        if tokio::time::timeout(timeout, flushes).await.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Event sinks did not flush in time"
            );
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Re-emits events as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &Event) {
        let run_id = event.run_id.as_str();
        match &event.kind {
            EventKind::RunStarted { workflow_id, graph } => {
                tracing::info!(run_id, workflow_id = ?workflow_id, graph = %graph, "Run started")
            }
            EventKind::RunFinished {
                status,
                error,
                supersteps,
            } => match error {
                Some(error) => {
                    tracing::warn!(run_id, status = %status, supersteps, error = %error, "Run finished")
                }
                None => tracing::info!(run_id, status = %status, supersteps, "Run finished"),
            },
            EventKind::SuperstepStarted {
                superstep,
                candidates,
            } => tracing::debug!(run_id, superstep, candidates = ?candidates, "Superstep started"),
            EventKind::NodeStarted { node, superstep } => {
                tracing::debug!(run_id, node = %node, superstep, "Node started")
            }
            EventKind::NodeFinished {
                node,
                superstep,
                outputs,
                cached,
                partial,
            } => tracing::debug!(
                run_id,
                node = %node,
                superstep,
                outputs = ?outputs,
                cached,
                partial,
                "Node finished"
            ),
            EventKind::NodeFailed {
                node,
                superstep,
                error,
            } => tracing::warn!(run_id, node = %node, superstep, error = %error, "Node failed"),
            EventKind::RouteDecided {
                gate,
                superstep,
                targets,
            } => tracing::debug!(run_id, gate = %gate, superstep, targets = ?targets, "Route decided"),
            EventKind::Paused {
                node,
                path,
                response_key,
            } => tracing::info!(run_id, node = %node, path = %path, response_key = %response_key, "Run paused"),
            EventKind::StopRequested { superstep } => {
                tracing::info!(run_id, superstep, "Stop requested")
            }
            EventKind::StreamChunk { node, index, .. } => {
                tracing::trace!(run_id, node = %node, index, "Stream chunk")
            }
            EventKind::CacheHit { node } => tracing::debug!(run_id, node = %node, "Cache hit"),
        }
    }
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: &Event) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event received so far
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Variant names in arrival order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind.name()).collect()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
