pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use admission::{AdmissionError, SubmitRequest, Submission, Submitter};
pub use config::{load_config, load_config_from_str, PipelineConfig};
pub use db::Database;
pub use error::{ConfigError, LabflowError, Result, TelemetryError, WorkerError};
pub use events::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use job::{FailureKind, InputParams, Job, JobError, JobStatus, StageResult};
pub use orchestrator::{CompletionNotifier, ErrorHandler, JobOutcome, Orchestrator, SkipReason};
pub use pipeline::{
    CommandHandler, InputMapping, RetryPolicy, StageDefinition, StageError, StageHandler,
    StageRegistry,
};
pub use queue::{AdmissionMessage, IngestionQueue, QueueError, SqliteQueue};
pub use store::{JobStore, StoreError};
pub use worker::{WorkerPool, WorkerReport};
