//! Durable job state.

pub mod error;
pub mod job_store;
pub mod status;

pub use error::{ConflictReason, StoreError};
pub use job_store::{CreateOutcome, JobQuery, JobStore, StageCompletion, DEFAULT_LEASE_TTL};
pub use status::{JobStatusView, JobSummary, StatusCounts};
