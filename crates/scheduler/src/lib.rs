//! Batch scheduling: the priority queue, the dual worker budget, and the
//! [`ExecutionManager`] orchestrating execution lifecycles end to end.

pub mod budget;
pub mod error;
pub mod manager;
pub mod model;
pub mod queue;

pub use budget::WorkerBudget;
pub use error::SchedulerError;
pub use manager::ExecutionManager;
pub use model::{
    BatchEntry, BatchOptions, BatchStopOutcome, SchedulerConfig, StopOutcome,
};
pub use queue::{ExecutionQueue, QueueItem};
