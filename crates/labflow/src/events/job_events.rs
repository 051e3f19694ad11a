//! Job event broadcaster for real-time lifecycle streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::JobStatus;

/// What happened to a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Started,
    StageStarted,
    StageRetrying,
    StageSucceeded,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Started => write!(f, "Started"),
            JobEventKind::StageStarted => write!(f, "Stage started"),
            JobEventKind::StageRetrying => write!(f, "Stage retrying"),
            JobEventKind::StageSucceeded => write!(f, "Stage succeeded"),
            JobEventKind::Succeeded => write!(f, "Succeeded"),
            JobEventKind::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobEventKind,
    /// Job status after this event.
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Attempt number for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: &str, kind: JobEventKind, status: JobStatus, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            status,
            stage: None,
            attempt: None,
            progress: 0,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_stage(mut self, stage: &str, attempt: u32) -> Self {
        self.stage = Some(stage.to_string());
        self.attempt = Some(attempt);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress;
        self
    }
}

/// Broadcasts job events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscribers_is_ok() {
        let broadcaster = JobEventBroadcaster::default();
        broadcaster.send(JobEvent::new("j1", JobEventKind::Started, JobStatus::Running, "go"));
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_events_in_order() {
        let broadcaster = JobEventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(JobEvent::new("j1", JobEventKind::Started, JobStatus::Running, "go"));
        broadcaster.send(
            JobEvent::new("j1", JobEventKind::StageSucceeded, JobStatus::Running, "parsed")
                .for_stage("parse", 1)
                .with_progress(10),
        );

        assert_eq!(rx.try_recv().unwrap().kind, JobEventKind::Started);
        let stage = rx.try_recv().unwrap();
        assert_eq!(stage.stage.as_deref(), Some("parse"));
        assert_eq!(stage.progress, 10);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = JobEvent::new("j1", JobEventKind::StageRetrying, JobStatus::Running, "busy")
            .for_stage("parse", 2);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["kind"], "stage_retrying");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["attempt"], 2);
    }
}
