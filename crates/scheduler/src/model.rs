//! Scheduler configuration and the live (in-registry) execution and batch
//! entries backing the durable records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use autoflow_core_types::{BatchId, BatchStatus, ExecutionId, ExecutionStatus, Workflow};
use autoflow_flow::Executor;
use autoflow_state_store::{BatchProgress, BatchRecord, BatchSource, ExecutionRecord};

pub const DEFAULT_GLOBAL_WORKERS: usize = 4;
pub const DEFAULT_TERMINAL_LINGER: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Workers shared by every batch.
    pub global_workers: usize,
    /// How long finished entries stay queryable in the live registry before
    /// eviction. Durable records outlive this.
    pub terminal_linger: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_workers: DEFAULT_GLOBAL_WORKERS,
            terminal_linger: DEFAULT_TERMINAL_LINGER,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Per-batch worker cap; defaults to the global limit.
    pub workers: Option<usize>,
    /// Higher dispatches first; ties dispatch in submission order.
    pub priority: i32,
    pub source: BatchSource,
    pub output_path: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: None,
            priority: 0,
            source: BatchSource::Inline { count: 0 },
            output_path: None,
        }
    }
}

/// One submitted workflow, already parsed or rejected. Invalid entries count
/// toward the batch total but are never executed.
pub enum BatchEntry {
    Valid {
        workflow: Workflow,
        path: Option<PathBuf>,
    },
    Invalid {
        path: Option<PathBuf>,
        error: String,
    },
}

/// What a stop request found.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StopOutcome {
    pub was_running: bool,
    pub was_queued: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchStopOutcome {
    pub running_stopped: usize,
    pub queued_cancelled: usize,
}

pub(crate) struct ExecutionState {
    pub status: ExecutionStatus,
    pub worker: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set while the entry is still queued; dispatch consumes and discards
    /// cancelled items instead of running them.
    pub cancelled: bool,
    /// Guards the single pool-release/accounting path.
    pub finalized: bool,
}

pub(crate) struct ExecutionEntry {
    pub id: ExecutionId,
    pub batch: Option<BatchId>,
    pub workflow_id: String,
    pub workflow_name: String,
    pub executor: Arc<Executor>,
    pub state: Mutex<ExecutionState>,
}

impl ExecutionEntry {
    pub fn new(
        id: ExecutionId,
        batch: Option<BatchId>,
        workflow: &Workflow,
        executor: Arc<Executor>,
        status: ExecutionStatus,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            batch,
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            executor,
            state: Mutex::new(ExecutionState {
                status,
                worker: None,
                started_at: None,
                finished_at: None,
                last_error: None,
                cancelled: false,
                finalized: false,
            }),
        })
    }

    pub fn record(&self) -> ExecutionRecord {
        let state = self.state.lock();
        ExecutionRecord {
            id: self.id.clone(),
            batch_id: self.batch.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: state.status,
            worker_id: state.worker,
            started_at: state.started_at,
            finished_at: state.finished_at,
            last_error: state.last_error.clone(),
        }
    }
}

pub(crate) struct BatchState {
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub running: usize,
    pub queued: usize,
    pub status: BatchStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub completion_announced: bool,
}

pub(crate) struct BatchMeta {
    pub id: BatchId,
    pub source: BatchSource,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub workers: usize,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub output_path: Option<PathBuf>,
    pub executions: Vec<ExecutionId>,
    pub state: Mutex<BatchState>,
}

impl BatchMeta {
    pub fn progress(state: &BatchState) -> BatchProgress {
        BatchProgress {
            completed: state.completed,
            failed: state.failed,
            stopped: state.stopped,
            running: state.running,
            queued: state.queued,
        }
    }

    pub fn record(&self) -> BatchRecord {
        let state = self.state.lock();
        BatchRecord {
            id: self.id.clone(),
            source: self.source.clone(),
            total: self.total,
            valid: self.valid,
            invalid: self.invalid,
            progress: Self::progress(&state),
            workers: self.workers,
            priority: self.priority,
            status: state.status,
            created_at: self.created_at,
            finished_at: state.finished_at,
            output_path: self.output_path.clone(),
            executions: self.executions.clone(),
        }
    }
}
