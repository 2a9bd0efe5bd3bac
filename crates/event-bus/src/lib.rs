//! Lifecycle event broadcast. Consumers (CLI progress display, tooling) use
//! these for observation only; nothing in the scheduling contract depends on
//! a subscriber being present.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use autoflow_core_types::{BatchId, BatchStatus, ExecutionId, ExecutionStatus, NodeId};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum FlowEvent {
    BatchStarted {
        batch: BatchId,
        total: usize,
        valid: usize,
    },
    BatchCompleted {
        batch: BatchId,
        status: BatchStatus,
        completed: usize,
        failed: usize,
    },
    ExecutionStarted {
        execution: ExecutionId,
        batch: Option<BatchId>,
        worker: Option<u64>,
    },
    ExecutionFinished {
        execution: ExecutionId,
        batch: Option<BatchId>,
        status: ExecutionStatus,
        error: Option<String>,
    },
    NodeStarted {
        execution: ExecutionId,
        node: NodeId,
        kind: String,
    },
    NodeFinished {
        execution: ExecutionId,
        node: NodeId,
        error: Option<String>,
    },
    NodePaused {
        execution: ExecutionId,
        node: NodeId,
        reason: String,
    },
}

/// Broadcast hub. Publishing never fails: with no subscribers the event is
/// simply dropped.
pub struct EventHub {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn publish(&self, event: FlowEvent) {
        trace!(target: "events", ?event, "publish");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}
