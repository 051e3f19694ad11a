//! Terminal stages: the error handler and the completion notifier.
//!
//! They run once per job after the last regular stage (or the failing one)
//! and never feed back into the pipeline. A failing hook is retried a
//! small fixed number of times and then only logged.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde_json::json;

use crate::job::{Job, JobError};
use crate::pipeline::{CommandHandler, Sleeper, StageError, StageHandler};

/// Attempts per terminal hook.
pub const TERMINAL_ATTEMPTS: u32 = 3;

/// Pause between terminal hook attempts.
pub const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Invoked with the accumulated job state and the error that ended it.
pub trait ErrorHandler: Send + Sync {
    fn on_failure(&self, job: &Job, error: &JobError) -> Result<(), StageError>;
}

/// Invoked once every stage of a job has succeeded.
pub trait CompletionNotifier: Send + Sync {
    fn on_success(&self, job: &Job) -> Result<(), StageError>;
}

/// Default hooks: write the outcome to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTerminal;

impl ErrorHandler for LoggingTerminal {
    fn on_failure(&self, job: &Job, error: &JobError) -> Result<(), StageError> {
        log::error!(
            "Job {} (user {}) failed in stage '{}' after {} attempt(s): {}",
            job.job_id,
            job.user_id,
            error.stage,
            error.attempts,
            error.message
        );
        Ok(())
    }
}

impl CompletionNotifier for LoggingTerminal {
    fn on_success(&self, job: &Job) -> Result<(), StageError> {
        log::info!(
            "Job {} (user {}) completed {} stage(s)",
            job.job_id,
            job.user_id,
            job.stage_results.len()
        );
        Ok(())
    }
}

/// Runs an external command as a terminal hook. The command receives
/// `{"event": "failed" | "succeeded", "job": .., "error": ..}` on stdin.
#[derive(Debug, Clone)]
pub struct CommandTerminal {
    command: CommandHandler,
}

impl CommandTerminal {
    pub fn new(command: CommandHandler) -> Self {
        Self { command }
    }
}

impl ErrorHandler for CommandTerminal {
    fn on_failure(&self, job: &Job, error: &JobError) -> Result<(), StageError> {
        let payload = json!({ "event": "failed", "job": job, "error": error });
        self.command.invoke(&job.job_id, &payload).map(|_| ())
    }
}

impl CompletionNotifier for CommandTerminal {
    fn on_success(&self, job: &Job) -> Result<(), StageError> {
        let payload = json!({ "event": "succeeded", "job": job });
        self.command.invoke(&job.job_id, &payload).map(|_| ())
    }
}

/// Runs a terminal hook up to [`TERMINAL_ATTEMPTS`] times. Returns whether
/// it eventually succeeded; failures and panics are logged, never raised.
pub(crate) fn run_terminal<F>(hook: &str, job_id: &str, sleeper: &dyn Sleeper, mut f: F) -> bool
where
    F: FnMut() -> Result<(), StageError>,
{
    for attempt in 1..=TERMINAL_ATTEMPTS {
        let result = panic::catch_unwind(AssertUnwindSafe(&mut f))
            .unwrap_or_else(|_| Err(StageError::fatal("hook panicked")));
        match result {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(
                    job_id,
                    hook,
                    attempt,
                    error = %e,
                    "terminal hook failed"
                );
                if attempt < TERMINAL_ATTEMPTS {
                    sleeper.sleep(TERMINAL_RETRY_DELAY);
                }
            }
        }
    }
    tracing::error!(job_id, hook, "terminal hook gave up after {} attempts", TERMINAL_ATTEMPTS);
    false
}
