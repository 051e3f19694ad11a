//! Pipeline shape: stage handlers, retry policy, input mapping, and the
//! ordered stage registry.

pub mod command;
pub mod error;
pub mod mapping;
pub mod registry;
pub mod retry;
pub mod stage;

pub use command::CommandHandler;
pub use error::{MappingError, RegistryError};
pub use mapping::{InputMapping, ParamSelection, UpstreamSelection};
pub use registry::{default_retry, StageDefinition, StageRegistry, STANDARD_STAGES};
pub use retry::{backoff_delay, run_with_retry, AttemptOutcome, RetryOn, RetryPolicy, Sleeper, ThreadSleeper};
pub use stage::{StageError, StageHandler};
