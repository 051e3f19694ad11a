//! Stage handler contract.

use serde_json::Value;
use thiserror::Error;

/// Classified failure returned by a stage handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Retryable per the stage's retry policy.
    #[error("transient stage error: {0}")]
    Transient(String),

    /// Escalates to the error path immediately.
    #[error("fatal stage error: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StageError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(m) | StageError::Fatal(m) => m,
        }
    }
}

/// One unit of pipeline work.
///
/// Handlers receive the job id and the projected input and return an opaque
/// JSON payload that is recorded as the stage's result. They may be invoked
/// more than once for the same job and stage and must tolerate that.
pub trait StageHandler: Send + Sync {
    fn invoke(&self, job_id: &str, input: &Value) -> Result<Value, StageError>;
}

impl<F> StageHandler for F
where
    F: Fn(&str, &Value) -> Result<Value, StageError> + Send + Sync,
{
    fn invoke(&self, job_id: &str, input: &Value) -> Result<Value, StageError> {
        self(job_id, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closure_is_a_handler() {
        let handler = |job_id: &str, input: &Value| -> Result<Value, StageError> {
            Ok(json!({ "job": job_id, "echo": input }))
        };
        let out = handler.invoke("j1", &json!(1)).unwrap();
        assert_eq!(out, json!({ "job": "j1", "echo": 1 }));
    }

    #[test]
    fn test_error_classification() {
        assert!(StageError::transient("busy").is_transient());
        assert!(!StageError::fatal("bad").is_transient());
        assert_eq!(StageError::fatal("bad").message(), "bad");
    }
}
