//! Job store error types.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::JobStatus;

/// Why a conditioned write was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The record's status did not match the caller's expectation.
    StatusMismatch {
        expected: JobStatus,
        actual: JobStatus,
    },
    /// Another execution holds a live lease on the job.
    LeaseHeld { owner: String },
    /// The caller does not hold the lease it is writing under.
    NotOwner,
    /// A result for this stage is already recorded.
    StageAlreadyRecorded(String),
    /// The job already reached a terminal status.
    Terminal(JobStatus),
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::StatusMismatch { expected, actual } => {
                write!(f, "expected status {}, found {}", expected, actual)
            }
            ConflictReason::LeaseHeld { owner } => write!(f, "lease held by {}", owner),
            ConflictReason::NotOwner => write!(f, "caller does not hold the lease"),
            ConflictReason::StageAlreadyRecorded(stage) => {
                write!(f, "stage '{}' already recorded", stage)
            }
            ConflictReason::Terminal(status) => write!(f, "job is already {}", status),
        }
    }
}

/// Errors from job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict on job {job_id}: {reason}")]
    Conflict {
        job_id: String,
        reason: ConflictReason,
    },

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("Failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn conflict(job_id: &str, reason: ConflictReason) -> Self {
        StoreError::Conflict {
            job_id: job_id.to_string(),
            reason,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(DatabaseError::Sqlite(e))
    }
}
