//! The execution engine.
//!
//! One generic loop walks the stage registry for a job: claim the record,
//! skip stages that already have results, run each remaining stage under
//! its retry policy, record the result, and end in either the completion
//! notifier or the error handler. Stage failures are job-scoped and end as
//! a FAILED record; they never escape this module.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::events::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::job::{FailureKind, Job, JobError, JobStatus};
use crate::pipeline::{run_with_retry, Sleeper, StageDefinition, StageRegistry, ThreadSleeper};
use crate::queue::{Delivery, IngestionQueue};
use crate::store::{ConflictReason, JobStore, StageCompletion, StoreError};

use super::error::OrchestratorError;
use super::terminal::{run_terminal, CompletionNotifier, ErrorHandler, LoggingTerminal};

/// Stage name recorded when a job fails before any stage could run.
pub const ORCHESTRATOR_STAGE: &str = "orchestrator";

/// Floor for the lease heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(5);

/// Why an execution stopped without driving the job to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The job was already SUCCEEDED or FAILED.
    AlreadyTerminal(JobStatus),
    /// Another execution holds the job.
    OwnedElsewhere,
    /// Ownership was lost while running, usually to a lease takeover.
    LostOwnership,
}

impl From<&ConflictReason> for SkipReason {
    fn from(reason: &ConflictReason) -> Self {
        match reason {
            ConflictReason::Terminal(status) => SkipReason::AlreadyTerminal(*status),
            ConflictReason::LeaseHeld { .. } => SkipReason::OwnedElsewhere,
            _ => SkipReason::LostOwnership,
        }
    }
}

/// How one execution of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { job_id: String },
    Failed { job_id: String, error: JobError },
    Skipped { job_id: String, reason: SkipReason },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Succeeded { job_id }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::Skipped { job_id, .. } => job_id,
        }
    }
}

enum StageStep {
    Recorded(Job),
    Failed(JobError),
    Lost(SkipReason),
}

pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    store: JobStore,
    error_handler: Arc<dyn ErrorHandler>,
    notifier: Arc<dyn CompletionNotifier>,
    events: Option<JobEventBroadcaster>,
    sleeper: Arc<dyn Sleeper>,
    instance_id: String,
}

impl Orchestrator {
    pub fn new(registry: Arc<StageRegistry>, store: JobStore) -> Self {
        let instance = Uuid::new_v4().simple().to_string();
        Self {
            registry,
            store,
            error_handler: Arc::new(LoggingTerminal),
            notifier: Arc::new(LoggingTerminal),
            events: None,
            sleeper: Arc::new(ThreadSleeper),
            instance_id: format!("labflow-{}", &instance[..8]),
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_completion_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_events(mut self, events: JobEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Prefix for execution owner ids written to job leases.
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Admits one dequeued message and drives its job.
    ///
    /// The message is acknowledged only after the PENDING record is
    /// durable; if the record cannot be written the delivery is released
    /// for redelivery instead.
    pub fn handle_delivery(
        &self,
        queue: &dyn IngestionQueue,
        delivery: Delivery,
    ) -> Result<JobOutcome, OrchestratorError> {
        let message = &delivery.message;
        let _span = info_span!(
            "delivery",
            job_id = %message.job_id,
            delivery = delivery.receive_count,
        )
        .entered();

        if let Err(e) =
            self.store
                .create_if_absent(&message.job_id, &message.user_id, &message.input_params)
        {
            warn!(error = %e, "could not record admission, releasing message");
            if let Err(release_err) = queue.release(&delivery.token) {
                warn!(error = %release_err, "release failed, message reappears after its visibility window");
            }
            return Err(e.into());
        }

        if let Err(e) = queue.ack(&delivery.token) {
            // The record exists, so a redelivery only leads to a no-op create.
            warn!(error = %e, "acknowledgement failed");
        }

        self.run_job(&message.job_id)
    }

    /// Operator-triggered resume of a job left RUNNING or PENDING.
    /// Continues after the last recorded stage.
    pub fn resume(&self, job_id: &str) -> Result<JobOutcome, OrchestratorError> {
        info!(job_id, "resume requested");
        self.run_job(job_id)
    }

    /// Resumes up to `limit` jobs that nobody is driving.
    pub fn recover_stalled(&self, limit: u64) -> Result<Vec<JobOutcome>, OrchestratorError> {
        let ids = self.store.stalled_jobs(limit)?;
        if !ids.is_empty() {
            info!(count = ids.len(), "recovering stalled jobs");
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for job_id in ids {
            match self.run_job(&job_id) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(job_id = %job_id, error = %e, "recovery failed"),
            }
        }
        Ok(outcomes)
    }

    /// Drives one job from its current state to a terminal status.
    pub fn run_job(&self, job_id: &str) -> Result<JobOutcome, OrchestratorError> {
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4().simple());
        let _span = info_span!("job", job_id, owner = %owner).entered();

        let job = match self.store.claim_for_execution(job_id, &owner) {
            Ok(job) => job,
            Err(StoreError::Conflict { reason, .. }) => {
                debug!(%reason, "job not claimable, discarding duplicate execution");
                return Ok(JobOutcome::Skipped {
                    job_id: job_id.to_string(),
                    reason: SkipReason::from(&reason),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.execute(job, &owner);
        if let Err(e) = &result {
            // Hand the job back so a resume does not wait for the lease to expire.
            match self.store.release(job_id, &owner) {
                Ok(released) => warn!(error = %e, released, "execution aborted"),
                Err(release_err) => {
                    warn!(error = %e, release_error = %release_err, "execution aborted, lease kept")
                }
            }
        }
        result
    }

    fn execute(&self, mut job: Job, owner: &str) -> Result<JobOutcome, OrchestratorError> {
        let job_id = job.job_id.clone();
        let job_id = job_id.as_str();

        let start = match self.registry.resume_point(&job.stage_results) {
            Ok(start) => start,
            Err(e) => {
                let stage = job
                    .current_stage
                    .clone()
                    .unwrap_or_else(|| ORCHESTRATOR_STAGE.to_string());
                let error = JobError::new(&stage, e.to_string(), 0, FailureKind::Internal);
                return self.fail(&job, owner, error);
            }
        };

        if start > 0 {
            info!(completed = start, "resuming after recorded stages");
        }
        self.emit(
            JobEvent::new(job_id, JobEventKind::Started, JobStatus::Running, "Job started")
                .with_progress(job.progress),
        );

        for stage in &self.registry.stages()[start..] {
            match self.run_stage(&job, owner, stage)? {
                StageStep::Recorded(updated) => job = updated,
                StageStep::Failed(error) => return self.fail(&job, owner, error),
                StageStep::Lost(reason) => {
                    return Ok(JobOutcome::Skipped {
                        job_id: job_id.to_string(),
                        reason,
                    })
                }
            }
        }

        self.complete(&job, owner)
    }

    fn run_stage(
        &self,
        job: &Job,
        owner: &str,
        stage: &StageDefinition,
    ) -> Result<StageStep, OrchestratorError> {
        let job_id = job.job_id.as_str();
        let _span = info_span!("stage", stage = %stage.name).entered();

        if let Err(e) = self.store.mark_stage_started(job_id, owner, &stage.name) {
            return match e {
                StoreError::Conflict { reason, .. } => Ok(StageStep::Lost(self.resolve_conflict(
                    job_id,
                    &stage.name,
                    &reason,
                ))),
                other => Err(other.into()),
            };
        }
        self.emit(
            JobEvent::new(
                job_id,
                JobEventKind::StageStarted,
                JobStatus::Running,
                &format!("Running {}", stage.name),
            )
            .for_stage(&stage.name, 1)
            .with_progress(job.progress),
        );

        let input = match stage.input.project(
            job_id,
            &stage.name,
            &job.input_params,
            &job.stage_results,
        ) {
            Ok(input) => input,
            Err(e) => {
                return Ok(StageStep::Failed(JobError::new(
                    &stage.name,
                    e.to_string(),
                    0,
                    FailureKind::Internal,
                )))
            }
        };

        let outcome = self.with_heartbeat(job_id, owner, || {
            run_with_retry(
                stage.handler.as_ref(),
                &stage.retry,
                job_id,
                &input,
                self.sleeper.as_ref(),
                |attempt, error, delay| {
                    warn!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "stage attempt failed, retrying");
                    self.emit(
                        JobEvent::new(
                            job_id,
                            JobEventKind::StageRetrying,
                            JobStatus::Running,
                            error.message(),
                        )
                        .for_stage(&stage.name, attempt + 1)
                        .with_progress(job.progress),
                    );
                },
            )
        });

        let output = match outcome.result {
            Ok(output) => output,
            Err(error) => {
                let kind = if error.is_transient() {
                    FailureKind::RetriesExhausted
                } else {
                    FailureKind::Fatal
                };
                return Ok(StageStep::Failed(JobError::new(
                    &stage.name,
                    error.message(),
                    outcome.attempts,
                    kind,
                )));
            }
        };

        let completion = StageCompletion {
            stage: stage.name.clone(),
            output,
            attempts: outcome.attempts,
            progress: stage.progress,
        };
        match self
            .store
            .append_stage_result(job_id, owner, &completion, JobStatus::Running)
        {
            Ok(updated) => {
                debug!(attempts = outcome.attempts, "stage recorded");
                self.emit(
                    JobEvent::new(
                        job_id,
                        JobEventKind::StageSucceeded,
                        JobStatus::Running,
                        &format!("{} completed", stage.name),
                    )
                    .for_stage(&stage.name, outcome.attempts)
                    .with_progress(updated.progress),
                );
                Ok(StageStep::Recorded(updated))
            }
            Err(StoreError::Conflict { reason, .. }) => Ok(StageStep::Lost(
                self.resolve_conflict(job_id, &stage.name, &reason),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `f` while a background thread keeps renewing the job's lease,
    /// so a long stage is never taken over by `resume` or `recover_stalled`.
    fn with_heartbeat<T>(&self, job_id: &str, owner: &str, f: impl FnOnce() -> T) -> T {
        let period = (self.store.lease_ttl() / 3).max(MIN_HEARTBEAT);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let store = &self.store;
        let span = Span::current();

        thread::scope(|scope| {
            scope.spawn(move || {
                let _entered = span.enter();
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => match store.renew_lease(job_id, owner) {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!("lease lost while the stage was running");
                                break;
                            }
                            Err(e) => warn!(error = %e, "lease renewal failed"),
                        },
                        _ => break,
                    }
                }
            });
            let result = f();
            drop(stop_tx);
            result
        })
    }

    /// Re-reads the record after a refused write. The other writer's
    /// progress stands; this execution stops without touching the job.
    fn resolve_conflict(&self, job_id: &str, stage: &str, reason: &ConflictReason) -> SkipReason {
        match self.store.read(job_id) {
            Ok(current) => debug!(
                %reason,
                status = %current.status,
                stage_recorded = current.has_stage_result(stage),
                "write refused, another execution owns the job"
            ),
            Err(e) => debug!(%reason, error = %e, "write refused and re-read failed"),
        }
        SkipReason::from(reason)
    }

    /// Records the failure, then runs the error handler. An execution that
    /// lost the job never reaches the hook.
    fn fail(&self, job: &Job, owner: &str, error: JobError) -> Result<JobOutcome, OrchestratorError> {
        let job_id = job.job_id.as_str();
        match self.store.mark_failed(job_id, owner, &error) {
            Ok(failed) => {
                run_terminal("error handler", job_id, self.sleeper.as_ref(), || {
                    self.error_handler.on_failure(&failed, &error)
                });
                self.emit(
                    JobEvent::new(job_id, JobEventKind::Failed, JobStatus::Failed, &error.to_string())
                        .for_stage(&error.stage, error.attempts)
                        .with_progress(failed.progress),
                );
                Ok(JobOutcome::Failed {
                    job_id: job_id.to_string(),
                    error,
                })
            }
            Err(StoreError::Conflict { reason, .. }) => {
                debug!(%reason, "failure not recorded, another execution owns the job");
                Ok(JobOutcome::Skipped {
                    job_id: job_id.to_string(),
                    reason: SkipReason::from(&reason),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn complete(&self, job: &Job, owner: &str) -> Result<JobOutcome, OrchestratorError> {
        let job_id = job.job_id.as_str();
        match self.store.mark_succeeded(job_id, owner) {
            Ok(succeeded) => {
                run_terminal("completion notifier", job_id, self.sleeper.as_ref(), || {
                    self.notifier.on_success(&succeeded)
                });
                self.emit(
                    JobEvent::new(job_id, JobEventKind::Succeeded, JobStatus::Succeeded, "Job completed")
                        .with_progress(100),
                );
                Ok(JobOutcome::Succeeded {
                    job_id: job_id.to_string(),
                })
            }
            Err(StoreError::Conflict { reason, .. }) => {
                debug!(%reason, "completion not recorded, another execution owns the job");
                Ok(JobOutcome::Skipped {
                    job_id: job_id.to_string(),
                    reason: SkipReason::from(&reason),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}
