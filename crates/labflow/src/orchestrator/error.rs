//! Orchestrator error types.
//!
//! Stage failures never show up here; they end the job as FAILED. These
//! are infrastructure failures that leave the job for a later resume.

use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
