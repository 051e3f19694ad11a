use chrono::{DateTime, Utc};

use crate::orchestrator::JobOutcome;

/// What a worker did with one delivery.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub message_id: String,
    pub job_id: String,
    /// The job outcome, or the infrastructure error that left the message
    /// for redelivery.
    pub result: Result<JobOutcome, String>,
    pub finished_at: DateTime<Utc>,
}

impl WorkerReport {
    pub fn completed(worker_id: usize, message_id: &str, outcome: JobOutcome) -> Self {
        Self {
            worker_id,
            message_id: message_id.to_string(),
            job_id: outcome.job_id().to_string(),
            result: Ok(outcome),
            finished_at: Utc::now(),
        }
    }

    pub fn errored(worker_id: usize, message_id: &str, job_id: &str, error: String) -> Self {
        Self {
            worker_id,
            message_id: message_id.to_string(),
            job_id: job_id.to_string(),
            result: Err(error),
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, Ok(JobOutcome::Succeeded { .. }))
    }
}
