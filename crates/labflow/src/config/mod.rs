pub mod loader;
pub mod runtime;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    CommandConfig, InputConfig, PipelineConfig, QueueConfig, RetryConfig, SelectionSpec,
    StageConfig,
};
