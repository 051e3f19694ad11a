use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::command::EX_TEMPFAIL;
use crate::pipeline::RetryOn;
use crate::queue::DEAD_LETTER_THRESHOLD;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    /// SQLite file shared by the job store and the queue. Defaults to
    /// `~/.labflow/data/labflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default)]
    pub queue: QueueConfig,
    pub stages: Vec<StageConfig>,
    /// Error handler command, run once per failed job.
    #[serde(default)]
    pub on_failure: Option<CommandConfig>,
    /// Completion notifier command, run once per succeeded job.
    #[serde(default)]
    pub on_success: Option<CommandConfig>,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_lease_ttl_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub capacity: Option<u64>,
}

fn default_max_receive_count() -> u32 {
    DEAD_LETTER_THRESHOLD
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receive_count: default_max_receive_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            capacity: None,
        }
    }
}

/// An external program invoked with JSON on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![EX_TEMPFAIL]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(flatten)]
    pub run: CommandConfig,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub retry_on: RetryOn,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_params_spec")]
    pub params: SelectionSpec,
    #[serde(default = "default_upstream_spec")]
    pub upstream: SelectionSpec,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            params: default_params_spec(),
            upstream: default_upstream_spec(),
        }
    }
}

fn default_params_spec() -> SelectionSpec {
    SelectionSpec::Keyword("all".to_string())
}

fn default_upstream_spec() -> SelectionSpec {
    SelectionSpec::Keyword("previous".to_string())
}

/// Either a keyword (`"all"`, `"none"`, `"previous"`) or an explicit list
/// of names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionSpec {
    Keyword(String),
    Names(Vec<String>),
}
