//! Job record model: status lattice, stage envelope, and error record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod params;

pub use params::{InputParams, NotificationPrefs};

/// Lifecycle status of a job.
///
/// Transitions only go `Pending -> Running -> {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Terminal statuses admit no further writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Whether the failure that closed a job was retryable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors kept occurring until the attempt budget ran out.
    RetriesExhausted,
    /// The handler reported a non-retryable error.
    Fatal,
    /// The orchestrator could not execute the stage at all.
    Internal,
}

/// Structured error record stored on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub stage: String,
    pub message: String,
    pub attempts: u32,
    pub kind: FailureKind,
}

impl JobError {
    pub fn new(stage: &str, message: impl Into<String>, attempts: u32, kind: FailureKind) -> Self {
        Self {
            stage: stage.to_string(),
            message: message.into(),
            attempts,
            kind,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage '{}' failed after {} attempt(s): {}",
            self.stage, self.attempts, self.message
        )
    }
}

/// One entry of the stage envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage: String,
    pub output: Value,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// The durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Stage results in execution order.
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    pub input_params: InputParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Percent complete, taken from the last recorded stage.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.stage_results
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }

    pub fn has_stage_result(&self, stage: &str) -> bool {
        self.stage_results.iter().any(|r| r.stage == stage)
    }

    /// Names of the stages with a recorded result, in order.
    pub fn completed_stages(&self) -> Vec<&str> {
        self.stage_results.iter().map(|r| r.stage.as_str()).collect()
    }
}
