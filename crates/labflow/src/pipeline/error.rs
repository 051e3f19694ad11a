//! Stage registry and input projection errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Stage registry is empty")]
    Empty,

    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("Invalid stage name '{0}': must match ^[a-z][a-z0-9_]*$")]
    InvalidName(String),

    #[error("Stage '{stage}' reads '{reference}', which is not an upstream stage")]
    NotUpstream { stage: String, reference: String },

    #[error("Stage '{stage}' has an invalid retry policy: {reason}")]
    InvalidRetry { stage: String, reason: String },

    #[error("Stage '{stage}' has progress {progress}, must be between 0 and 100")]
    InvalidProgress { stage: String, progress: u8 },

    /// Recorded results do not form a prefix of the registry order.
    #[error("Recorded stages {recorded:?} do not match the registry order")]
    InconsistentResults { recorded: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("Stage '{stage}' needs the result of '{upstream}', which is not recorded")]
    MissingUpstream { stage: String, upstream: String },
}
