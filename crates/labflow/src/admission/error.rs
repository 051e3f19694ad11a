use thiserror::Error;

use crate::job::JobStatus;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("file_key is required")]
    MissingFileKey,

    #[error("Job {job_id} is {status}; only finished jobs can be resubmitted")]
    NotTerminal { job_id: String, status: JobStatus },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
