//! Retry policy and the bounded attempt loop around a stage handler.
//!
//! `backoff_delay` and `RetryPolicy::is_retryable` are pure; waiting is
//! delegated to a [`Sleeper`] so tests can observe delays without sleeping.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stage::{StageError, StageHandler};

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Which errors a policy retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Only errors the handler classified as transient.
    #[default]
    Transient,
    /// Every error, fatal ones included.
    Any,
    /// Nothing.
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    /// One attempt, no retry.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            retry_on: RetryOn::Never,
        }
    }

    /// Retries transient errors with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            retry_on: RetryOn::Transient,
        }
    }

    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    pub fn is_retryable(&self, error: &StageError) -> bool {
        match self.retry_on {
            RetryOn::Transient => error.is_transient(),
            RetryOn::Any => true,
            RetryOn::Never => false,
        }
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(&self, error: &StageError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.is_retryable(error)
    }

    /// Problems that make the policy unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Delay before the attempt following failed attempt `attempt` (1-based):
/// `base_delay * backoff_multiplier^(attempt - 1)`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = policy.base_delay.as_secs_f64() * policy.backoff_multiplier.powi(exponent);
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Blocks the current execution context between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// What the attempt loop produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub result: Result<Value, StageError>,
    pub attempts: u32,
}

/// Runs `handler` until it succeeds, the error is not retryable, or the
/// attempt budget is spent. A panicking handler counts as a fatal error.
///
/// `on_retry(attempt, error, delay)` is called before each wait.
pub fn run_with_retry<R>(
    handler: &dyn StageHandler,
    policy: &RetryPolicy,
    job_id: &str,
    input: &Value,
    sleeper: &dyn Sleeper,
    mut on_retry: R,
) -> AttemptOutcome
where
    R: FnMut(u32, &StageError, Duration),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = invoke_guarded(handler, job_id, input);
        match result {
            Ok(value) => {
                return AttemptOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(error) if policy.should_retry(&error, attempt) => {
                let delay = backoff_delay(policy, attempt);
                on_retry(attempt, &error, delay);
                sleeper.sleep(delay);
            }
            Err(error) => {
                return AttemptOutcome {
                    result: Err(error),
                    attempts: attempt,
                }
            }
        }
    }
}

fn invoke_guarded(
    handler: &dyn StageHandler,
    job_id: &str,
    input: &Value,
) -> Result<Value, StageError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(job_id, input))).unwrap_or_else(
        |payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StageError::Fatal(format!("stage handler panicked: {}", detail)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn parse_policy() -> RetryPolicy {
        RetryPolicy::exponential(3, Duration::from_secs(2), 2.0)
    }

    #[test]
    fn test_backoff_follows_exponential_curve() {
        let policy = parse_policy();
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::exponential(100, Duration::from_secs(1), 10.0);
        assert_eq!(backoff_delay(&policy, 50), MAX_BACKOFF);
    }

    #[test]
    fn test_retry_predicate() {
        let policy = parse_policy();
        let transient = StageError::transient("timeout");
        let fatal = StageError::fatal("corrupt");

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&fatal, 1));

        let any = parse_policy().with_retry_on(RetryOn::Any);
        assert!(any.should_retry(&fatal, 1));
        assert!(!RetryPolicy::single_attempt().should_retry(&transient, 1));
    }

    #[test]
    fn test_validate() {
        assert!(parse_policy().validate().is_ok());
        assert!(RetryPolicy::exponential(0, Duration::ZERO, 2.0).validate().is_err());
        assert!(RetryPolicy::exponential(2, Duration::ZERO, 0.5).validate().is_err());
        assert!(RetryPolicy::exponential(2, Duration::ZERO, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let handler = |_: &str, _: &Value| -> Result<Value, StageError> {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StageError::transient("busy"))
            } else {
                Ok(json!({ "rows": 96 }))
            }
        };
        let sleeper = RecordingSleeper::default();
        let mut retries = Vec::new();

        let outcome = run_with_retry(&handler, &parse_policy(), "j1", &json!({}), &sleeper, |a, _, d| {
            retries.push((a, d))
        });

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), json!({ "rows": 96 }));
        assert_eq!(
            *sleeper.0.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(retries.len(), 2);
    }

    #[test]
    fn test_exhausts_budget_on_persistent_transient_error() {
        let handler =
            |_: &str, _: &Value| -> Result<Value, StageError> { Err(StageError::transient("busy")) };
        let sleeper = RecordingSleeper::default();

        let outcome = run_with_retry(&handler, &parse_policy(), "j1", &json!({}), &sleeper, |_, _, _| {});

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, Err(StageError::transient("busy")));
        assert_eq!(sleeper.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let handler =
            |_: &str, _: &Value| -> Result<Value, StageError> { Err(StageError::fatal("bad file")) };
        let sleeper = RecordingSleeper::default();

        let outcome = run_with_retry(&handler, &parse_policy(), "j1", &json!({}), &sleeper, |_, _, _| {});

        assert_eq!(outcome.attempts, 1);
        assert!(sleeper.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_becomes_fatal_error() {
        let handler = |_: &str, _: &Value| -> Result<Value, StageError> { panic!("index out of range") };

        let outcome = run_with_retry(
            &handler,
            &parse_policy(),
            "j1",
            &json!({}),
            &ThreadSleeper,
            |_, _, _| {},
        );

        assert_eq!(outcome.attempts, 1);
        match outcome.result {
            Err(StageError::Fatal(message)) => assert!(message.contains("index out of range")),
            other => panic!("expected fatal error, got {:?}", other),
        }
    }
}
