use thiserror::Error;

use autoflow_core_types::{BatchId, FlowError};
use autoflow_driver::DriverError;
use autoflow_state_store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("driver: {0}")]
    Driver(String),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),
}

impl From<DriverError> for SchedulerError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err.to_string())
    }
}

impl From<FlowError> for SchedulerError {
    fn from(err: FlowError) -> Self {
        Self::InvalidWorkflow(err.to_string())
    }
}
