//! Job store backed by SQLite.
//!
//! Every mutating call runs in one transaction, so a stage result is never
//! visible without the matching `current_stage`/`updated_at` change. Writes
//! after admission are guarded by the execution lease: only the owner that
//! claimed the job can advance or close it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::db::job_repo::{self, JobFilter, JobRow, StageResultRow};
use crate::db::{now_millis, Database};
use crate::job::{InputParams, Job, JobError, JobStatus, StageResult};

use super::error::{ConflictReason, StoreError};
use super::status::{JobStatusView, JobSummary, StatusCounts};

/// How long a claimed job stays owned without a write from its owner.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(row: &JobRow) -> Result<JobStatus, StoreError> {
    row.status.parse().map_err(|reason| StoreError::Corrupt {
        job_id: row.job_id.clone(),
        reason,
    })
}

fn job_from_rows(row: JobRow, results: Vec<StageResultRow>) -> Result<Job, StoreError> {
    let status = parse_status(&row)?;
    let input_params: InputParams = serde_json::from_str(&row.input_params)?;
    let error: Option<JobError> = row
        .error
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    let stage_results = results
        .into_iter()
        .map(|r| {
            Ok(StageResult {
                stage: r.stage_name,
                output: serde_json::from_str(&r.output)?,
                attempts: r.attempts.max(0) as u32,
                recorded_at: parse_timestamp(&r.recorded_at),
            })
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;

    Ok(Job {
        job_id: row.job_id,
        user_id: row.user_id,
        status,
        current_stage: row.current_stage,
        stage_results,
        input_params,
        error,
        progress: row.progress.clamp(0, 100) as u8,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
    })
}

fn load(conn: &Connection, job_id: &str) -> Result<Job, StoreError> {
    let row = job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    let results = job_repo::stage_results(conn, job_id)?;
    job_from_rows(row, results)
}

fn load_row(conn: &Connection, job_id: &str) -> Result<(JobRow, JobStatus), StoreError> {
    let row = job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    let status = parse_status(&row)?;
    Ok((row, status))
}

/// Checks that `owner` may write to a RUNNING job.
fn require_owner(
    job_id: &str,
    row: &JobRow,
    status: JobStatus,
    expected: JobStatus,
    owner: &str,
) -> Result<(), StoreError> {
    if status != expected {
        let reason = if status.is_terminal() {
            ConflictReason::Terminal(status)
        } else {
            ConflictReason::StatusMismatch {
                expected,
                actual: status,
            }
        };
        return Err(StoreError::conflict(job_id, reason));
    }
    if row.lease_owner.as_deref() != Some(owner) {
        return Err(StoreError::conflict(job_id, ConflictReason::NotOwner));
    }
    Ok(())
}

// ─── Types ──────────────────────────────────────────────────────────────────

/// Result of an idempotent create.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub job: Job,
    /// `false` when the record already existed and was returned unchanged.
    pub created: bool,
}

/// A successful stage invocation ready to be recorded.
#[derive(Debug, Clone)]
pub struct StageCompletion {
    pub stage: String,
    pub output: Value,
    pub attempts: u32,
    /// Job progress once this stage is recorded.
    pub progress: u8,
}

/// Listing filter for [`JobStore::query`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Durable per-job state. Cheap to clone.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    lease_ttl: Duration,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn lease_deadline(&self) -> i64 {
        now_millis().saturating_add(self.lease_ttl.as_millis() as i64)
    }

    /// Creates a PENDING record for `job_id`, or returns the existing record
    /// untouched.
    pub fn create_if_absent(
        &self,
        job_id: &str,
        user_id: &str,
        input_params: &InputParams,
    ) -> Result<CreateOutcome, StoreError> {
        let now = format_timestamp(Utc::now());
        let row = JobRow {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            current_stage: None,
            input_params: serde_json::to_string(input_params)?,
            error: None,
            progress: 0,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };

        let outcome = self.db.with_transaction(|conn| {
            let created = job_repo::insert_if_absent(conn, &row)?;
            let job = load(conn, job_id)?;
            Ok::<_, StoreError>(CreateOutcome { job, created })
        })?;

        if outcome.created {
            log::info!("Job {} admitted for user {}", job_id, user_id);
        } else {
            log::debug!(
                "Job {} already exists with status {}, create is a no-op",
                job_id,
                outcome.job.status
            );
        }
        Ok(outcome)
    }

    /// Reads the full job record.
    pub fn read(&self, job_id: &str) -> Result<Job, StoreError> {
        self.db.with_transaction(|conn| load(conn, job_id))
    }

    /// Takes write ownership of a job and moves it to RUNNING.
    ///
    /// Succeeds for PENDING jobs and for RUNNING jobs whose lease is free,
    /// expired, or already held by `owner` (resume after a crash).
    pub fn claim_for_execution(&self, job_id: &str, owner: &str) -> Result<Job, StoreError> {
        let deadline = self.lease_deadline();
        let job = self.db.with_transaction(|conn| {
            let (row, status) = load_row(conn, job_id)?;
            if status.is_terminal() {
                return Err(StoreError::conflict(job_id, ConflictReason::Terminal(status)));
            }
            let now = Utc::now();
            let changed = job_repo::claim(
                conn,
                job_id,
                owner,
                now.timestamp_millis(),
                deadline,
                &format_timestamp(now),
            )?;
            if changed == 0 {
                return Err(StoreError::conflict(
                    job_id,
                    ConflictReason::LeaseHeld {
                        owner: row.lease_owner.unwrap_or_default(),
                    },
                ));
            }
            load(conn, job_id)
        })?;

        log::debug!("Job {} claimed by {}", job_id, owner);
        Ok(job)
    }

    /// Records the stage about to be attempted and renews the lease.
    pub fn mark_stage_started(
        &self,
        job_id: &str,
        owner: &str,
        stage: &str,
    ) -> Result<(), StoreError> {
        let deadline = self.lease_deadline();
        self.db.with_transaction(|conn| {
            let (row, status) = load_row(conn, job_id)?;
            require_owner(job_id, &row, status, JobStatus::Running, owner)?;
            job_repo::set_current_stage(
                conn,
                job_id,
                owner,
                stage,
                deadline,
                &format_timestamp(Utc::now()),
            )?;
            Ok(())
        })
    }

    /// Appends a stage result and advances `current_stage` in one
    /// transaction.
    ///
    /// Fails with `Conflict` when the status differs from `expected_status`,
    /// when `owner` no longer holds the lease, or when the stage already
    /// has a result.
    pub fn append_stage_result(
        &self,
        job_id: &str,
        owner: &str,
        completion: &StageCompletion,
        expected_status: JobStatus,
    ) -> Result<Job, StoreError> {
        let output = serde_json::to_string(&completion.output)?;
        let deadline = self.lease_deadline();

        let job = self.db.with_transaction(|conn| {
            let (row, status) = load_row(conn, job_id)?;
            require_owner(job_id, &row, status, expected_status, owner)?;
            if job_repo::has_stage_result(conn, job_id, &completion.stage)? {
                return Err(StoreError::conflict(
                    job_id,
                    ConflictReason::StageAlreadyRecorded(completion.stage.clone()),
                ));
            }

            let now = format_timestamp(Utc::now());
            job_repo::insert_stage_result(
                conn,
                job_id,
                &completion.stage,
                &output,
                completion.attempts,
                &now,
            )?;
            job_repo::advance(
                conn,
                job_id,
                expected_status.as_str(),
                owner,
                &completion.stage,
                completion.progress,
                deadline,
                &now,
            )?;
            load(conn, job_id)
        })?;

        log::debug!(
            "Job {} recorded stage '{}' ({} attempt(s))",
            job_id,
            completion.stage,
            completion.attempts
        );
        Ok(job)
    }

    /// Closes a RUNNING job as SUCCEEDED with progress 100.
    pub fn mark_succeeded(&self, job_id: &str, owner: &str) -> Result<Job, StoreError> {
        let job = self.close(job_id, owner, JobStatus::Succeeded, None)?;
        log::info!("Job {} succeeded", job_id);
        Ok(job)
    }

    /// Closes a RUNNING job as FAILED with the given error record.
    pub fn mark_failed(
        &self,
        job_id: &str,
        owner: &str,
        error: &JobError,
    ) -> Result<Job, StoreError> {
        let job = self.close(job_id, owner, JobStatus::Failed, Some(error))?;
        log::warn!("Job {} failed: {}", job_id, error);
        Ok(job)
    }

    fn close(
        &self,
        job_id: &str,
        owner: &str,
        status: JobStatus,
        error: Option<&JobError>,
    ) -> Result<Job, StoreError> {
        let error_json = error.map(serde_json::to_string).transpose()?;
        let progress = (status == JobStatus::Succeeded).then_some(100u8);

        self.db.with_transaction(|conn| {
            let (row, current) = load_row(conn, job_id)?;
            require_owner(job_id, &row, current, JobStatus::Running, owner)?;
            job_repo::close(
                conn,
                job_id,
                owner,
                status.as_str(),
                error_json.as_deref(),
                progress,
                &format_timestamp(Utc::now()),
            )?;
            load(conn, job_id)
        })
    }

    /// Extends the lease while a stage is running. Returns `false` once
    /// `owner` no longer holds a RUNNING job.
    pub fn renew_lease(&self, job_id: &str, owner: &str) -> Result<bool, StoreError> {
        let deadline = self.lease_deadline();
        let changed = self
            .db
            .with_conn(|conn| job_repo::renew_lease(conn, job_id, owner, deadline))?;
        Ok(changed > 0)
    }

    /// Gives up the lease without changing status, so another execution can
    /// resume the job immediately.
    pub fn release(&self, job_id: &str, owner: &str) -> Result<bool, StoreError> {
        let changed = self
            .db
            .with_conn(|conn| job_repo::release_lease(conn, job_id, owner))?;
        Ok(changed > 0)
    }

    /// Status query view of one job.
    pub fn status(&self, job_id: &str) -> Result<JobStatusView, StoreError> {
        let job = self.read(job_id)?;
        Ok(JobStatusView::from(&job))
    }

    /// Lists jobs, newest first, with the total number of matches.
    pub fn query(&self, query: &JobQuery) -> Result<(Vec<JobSummary>, u64), StoreError> {
        let filter = JobFilter {
            status: query.status.map(|s| s.as_str().to_string()),
            user_id: query.user_id.clone(),
            from_date: query.from.map(format_timestamp),
            to_date: query.to.map(format_timestamp),
            limit: query.limit,
            offset: query.offset,
        };

        let (rows, total) = self.db.with_conn(|conn| job_repo::query(conn, &filter))?;
        let summaries = rows
            .into_iter()
            .map(|row| {
                let status = parse_status(&row)?;
                Ok(JobSummary {
                    status,
                    progress: row.progress.clamp(0, 100) as u8,
                    created_at: parse_timestamp(&row.created_at),
                    updated_at: parse_timestamp(&row.updated_at),
                    job_id: row.job_id,
                    user_id: row.user_id,
                    current_stage: row.current_stage,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok((summaries, total))
    }

    pub fn counts(&self) -> Result<StatusCounts, StoreError> {
        let counts = self.db.with_conn(|conn| {
            Ok(StatusCounts {
                pending: job_repo::count_by_status(conn, JobStatus::Pending.as_str())?,
                running: job_repo::count_by_status(conn, JobStatus::Running.as_str())?,
                succeeded: job_repo::count_by_status(conn, JobStatus::Succeeded.as_str())?,
                failed: job_repo::count_by_status(conn, JobStatus::Failed.as_str())?,
            })
        })?;
        Ok(counts)
    }

    /// Jobs that are not terminal and have no live lease.
    pub fn stalled_jobs(&self, limit: u64) -> Result<Vec<String>, StoreError> {
        let ids = self
            .db
            .with_conn(|conn| job_repo::stalled(conn, now_millis(), limit))?;
        Ok(ids)
    }
}
