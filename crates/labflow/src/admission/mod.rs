//! Job admission: turns submissions and upload events into admission
//! messages on the ingestion queue.
//!
//! Admission never touches the job store directly. The PENDING record is
//! written by the orchestrator when it picks the message up, so a message
//! and its record cannot disagree.

pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::job::{InputParams, JobStatus, NotificationPrefs};
use crate::queue::{AdmissionMessage, IngestionQueue};
use crate::store::JobStore;

pub use error::AdmissionError;

pub const ANONYMOUS_USER: &str = "anonymous";

/// Storage prefix under which uploads trigger automatic admission.
pub const UPLOAD_PREFIX: &str = "raw/";

/// An explicit job submission. Unset fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub file_key: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reference_gene: Option<String>,
    #[serde(default)]
    pub control_condition: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub analysis_params: Map<String, Value>,
    #[serde(default)]
    pub email: Option<String>,
}

impl SubmitRequest {
    pub fn new(file_key: &str) -> Self {
        Self {
            file_key: file_key.to_string(),
            ..Default::default()
        }
    }
}

/// Acknowledgement returned to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

pub struct Submitter {
    queue: Arc<dyn IngestionQueue>,
}

impl Submitter {
    pub fn new(queue: Arc<dyn IngestionQueue>) -> Self {
        Self { queue }
    }

    /// Validates the request, fills in defaults and enqueues it under a
    /// fresh job id.
    pub fn submit(&self, request: SubmitRequest) -> Result<Submission, AdmissionError> {
        let file_key = request.file_key.trim();
        if file_key.is_empty() {
            return Err(AdmissionError::MissingFileKey);
        }

        let now = Utc::now();
        let mut params = InputParams::new(file_key);
        if let Some(gene) = non_empty(request.reference_gene) {
            params.reference_gene = gene;
        }
        if let Some(condition) = non_empty(request.control_condition) {
            params.control_condition = condition;
        }
        params.experiment_name = Some(
            non_empty(request.experiment_name)
                .unwrap_or_else(|| format!("Experiment_{}", now.format("%Y-%m-%d"))),
        );
        params.analysis_params = request.analysis_params;
        params.notification = match non_empty(request.email) {
            Some(email) => NotificationPrefs::email(&email),
            None => NotificationPrefs::default(),
        };

        let user_id = non_empty(request.user_id).unwrap_or_else(|| ANONYMOUS_USER.to_string());
        self.enqueue(&user_id, params, now)
    }

    /// Admits an upload event for `key`. Keys outside the upload prefix are
    /// ignored and yield `None`.
    pub fn admit_upload(&self, key: &str) -> Result<Option<Submission>, AdmissionError> {
        if !key.starts_with(UPLOAD_PREFIX) {
            debug!("Ignoring upload outside {}: {}", UPLOAD_PREFIX, key);
            return Ok(None);
        }

        let now = Utc::now();
        let mut params = InputParams::new(key);
        params.experiment_name = Some(format!("Auto_{}", now.format("%Y-%m-%d")));
        params.analysis_params = default_analysis_params();

        let user_id = user_from_key(key).unwrap_or(ANONYMOUS_USER);
        self.enqueue(user_id, params, now).map(Some)
    }

    /// Re-admits a finished job's input under a new job id. The original
    /// record is left as it is.
    pub fn resubmit(&self, store: &JobStore, job_id: &str) -> Result<Submission, AdmissionError> {
        let job = store.read(job_id)?;
        if !job.status.is_terminal() {
            return Err(AdmissionError::NotTerminal {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        let submission = self.enqueue(&job.user_id, job.input_params, Utc::now())?;
        info!("Job {} resubmitted as {}", job_id, submission.job_id);
        Ok(submission)
    }

    fn enqueue(
        &self,
        user_id: &str,
        params: InputParams,
        now: DateTime<Utc>,
    ) -> Result<Submission, AdmissionError> {
        let job_id = Uuid::new_v4().to_string();
        let message = AdmissionMessage::new(&job_id, user_id, params);
        let message_id = self.queue.enqueue(&message)?;

        info!("Created job {} (message {})", job_id, message_id);
        Ok(Submission {
            job_id,
            status: JobStatus::Pending,
            created_at: now,
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `raw/<user_id>/<file>` yields `<user_id>`.
fn user_from_key(key: &str) -> Option<&str> {
    let mut parts = key.split('/');
    parts.next()?;
    let user = parts.next()?;
    parts.next()?;
    (!user.is_empty()).then_some(user)
}

fn default_analysis_params() -> Map<String, Value> {
    let value = json!({
        "sd_cutoff": 0.5,
        "min_proportion": 0.5,
        "significance_level": 0.05,
        "p_adjust_method": "fdr_bh",
        "generate_plots": true,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::SqliteQueue;
    use std::time::Duration;

    fn setup() -> (Submitter, Arc<SqliteQueue>) {
        let queue = Arc::new(SqliteQueue::new(Database::open_in_memory().unwrap()));
        (Submitter::new(queue.clone()), queue)
    }

    fn next_message(queue: &SqliteQueue) -> AdmissionMessage {
        queue.dequeue(Duration::ZERO).unwrap().unwrap().message
    }

    #[test]
    fn test_submit_applies_defaults() {
        let (submitter, queue) = setup();
        let submission = submitter.submit(SubmitRequest::new("raw/u1/plate.csv")).unwrap();
        assert_eq!(submission.status, JobStatus::Pending);
        assert!(Uuid::parse_str(&submission.job_id).is_ok());

        let message = next_message(&queue);
        assert_eq!(message.job_id, submission.job_id);
        assert_eq!(message.user_id, "anonymous");
        let params = message.input_params;
        assert_eq!(params.reference_gene, "GAPDH");
        assert_eq!(params.control_condition, "CONTROL");
        assert!(params
            .experiment_name
            .as_deref()
            .is_some_and(|n| n.starts_with("Experiment_")));
        assert!(!params.notification.email_notification);
    }

    #[test]
    fn test_submit_keeps_explicit_values() {
        let (submitter, queue) = setup();
        let mut request = SubmitRequest::new("raw/u1/plate.csv");
        request.user_id = Some("u1".to_string());
        request.reference_gene = Some("ACTB".to_string());
        request.experiment_name = Some("Dose response".to_string());
        request.email = Some("pi@lab.org".to_string());
        request.analysis_params.insert("sd_cutoff".to_string(), json!(0.3));
        submitter.submit(request).unwrap();

        let message = next_message(&queue);
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.input_params.reference_gene, "ACTB");
        assert_eq!(message.input_params.experiment_name.as_deref(), Some("Dose response"));
        assert_eq!(message.input_params.notification, NotificationPrefs::email("pi@lab.org"));
        assert_eq!(message.input_params.analysis_params["sd_cutoff"], json!(0.3));
    }

    #[test]
    fn test_submit_requires_file_key() {
        let (submitter, queue) = setup();
        let err = submitter.submit(SubmitRequest::new("  ")).unwrap_err();
        assert!(matches!(err, AdmissionError::MissingFileKey));
        assert_eq!(queue.depth().unwrap().visible, 0);
    }

    #[test]
    fn test_admit_upload_only_under_prefix() {
        let (submitter, queue) = setup();
        assert!(submitter.admit_upload("processed/u1/out.csv").unwrap().is_none());
        assert_eq!(queue.depth().unwrap().visible, 0);

        submitter.admit_upload("raw/u7/plate.csv").unwrap().unwrap();
        let message = next_message(&queue);
        assert_eq!(message.user_id, "u7");
        assert_eq!(message.input_params.analysis_params["p_adjust_method"], "fdr_bh");
        assert_eq!(message.input_params.analysis_params["generate_plots"], true);
        assert!(message
            .input_params
            .experiment_name
            .as_deref()
            .is_some_and(|n| n.starts_with("Auto_")));
    }

    #[test]
    fn test_user_from_key() {
        assert_eq!(user_from_key("raw/u1/a.csv"), Some("u1"));
        assert_eq!(user_from_key("raw/a.csv"), None);
        assert_eq!(user_from_key("raw//a.csv"), None);
    }

    #[test]
    fn test_resubmit_requires_terminal_job() {
        let (submitter, queue) = setup();
        let store = JobStore::new(Database::open_in_memory().unwrap());
        store
            .create_if_absent("j1", "u1", &InputParams::new("raw/u1/a.csv"))
            .unwrap();

        let err = submitter.resubmit(&store, "j1").unwrap_err();
        assert!(matches!(err, AdmissionError::NotTerminal { status: JobStatus::Pending, .. }));

        store.claim_for_execution("j1", "w1").unwrap();
        store.mark_succeeded("j1", "w1").unwrap();
        let submission = submitter.resubmit(&store, "j1").unwrap();
        assert_ne!(submission.job_id, "j1");

        let message = next_message(&queue);
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.input_params.file_key, "raw/u1/a.csv");
        assert_eq!(store.read("j1").unwrap().status, JobStatus::Succeeded);
    }
}
