//! Turns a validated [`PipelineConfig`] into runtime components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{default_database_path, Database};
use crate::error::ConfigError;
use crate::orchestrator::{CommandTerminal, CompletionNotifier, ErrorHandler, LoggingTerminal};
use crate::pipeline::{
    default_retry, CommandHandler, InputMapping, ParamSelection, RetryPolicy, StageDefinition,
    StageRegistry, UpstreamSelection,
};
use crate::queue::SqliteQueue;
use crate::store::JobStore;

use super::schema::{CommandConfig, PipelineConfig, SelectionSpec, StageConfig};

impl PipelineConfig {
    /// Configured database path, else the per-user default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => default_database_path(),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.poll_timeout_ms)
    }

    pub fn build_registry(&self) -> Result<StageRegistry, ConfigError> {
        let stages = self
            .stages
            .iter()
            .map(stage_definition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StageRegistry::new(stages)?)
    }

    pub fn build_store(&self, db: Database) -> JobStore {
        JobStore::new(db).with_lease_ttl(self.lease_ttl())
    }

    pub fn build_queue(&self, db: Database) -> SqliteQueue {
        let queue = SqliteQueue::new(db)
            .with_max_receive_count(self.queue.max_receive_count)
            .with_visibility_timeout(Duration::from_secs(self.queue.visibility_timeout_secs));
        match self.queue.capacity {
            Some(capacity) => queue.with_capacity(capacity),
            None => queue,
        }
    }

    pub fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        match &self.on_failure {
            Some(command) => Arc::new(CommandTerminal::new(command.to_handler())),
            None => Arc::new(LoggingTerminal),
        }
    }

    pub fn completion_notifier(&self) -> Arc<dyn CompletionNotifier> {
        match &self.on_success {
            Some(command) => Arc::new(CommandTerminal::new(command.to_handler())),
            None => Arc::new(LoggingTerminal),
        }
    }
}

impl CommandConfig {
    pub fn to_handler(&self) -> CommandHandler {
        let mut handler = CommandHandler::new(&self.command)
            .args(self.args.iter().cloned())
            .transient_exit_codes(self.transient_exit_codes.clone());
        for (key, value) in &self.env {
            handler = handler.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            handler = handler.working_dir(dir);
        }
        if let Some(secs) = self.timeout_secs {
            handler = handler.timeout(Duration::from_secs(secs));
        }
        handler
    }
}

fn stage_definition(stage: &StageConfig) -> Result<StageDefinition, ConfigError> {
    let retry = match &stage.retry {
        Some(retry) => RetryPolicy::exponential(
            retry.max_attempts,
            Duration::from_millis(retry.base_delay_ms),
            retry.backoff_multiplier,
        )
        .with_retry_on(retry.retry_on),
        None => default_retry(&stage.name),
    };

    let input = InputMapping::new(
        param_selection(&stage.name, &stage.input.params)?,
        upstream_selection(&stage.name, &stage.input.upstream)?,
    );

    Ok(
        StageDefinition::new(&stage.name, Arc::new(stage.run.to_handler()))
            .with_input(input)
            .with_retry(retry)
            .with_progress(stage.progress),
    )
}

fn param_selection(stage: &str, spec: &SelectionSpec) -> Result<ParamSelection, ConfigError> {
    match spec {
        SelectionSpec::Keyword(k) if k == "all" => Ok(ParamSelection::All),
        SelectionSpec::Keyword(k) if k == "none" => Ok(ParamSelection::None),
        SelectionSpec::Names(keys) => Ok(ParamSelection::Keys(keys.clone())),
        SelectionSpec::Keyword(other) => Err(ConfigError::InvalidStage {
            name: stage.to_string(),
            reason: format!("input.params must be \"all\", \"none\" or a list, got \"{}\"", other),
        }),
    }
}

fn upstream_selection(stage: &str, spec: &SelectionSpec) -> Result<UpstreamSelection, ConfigError> {
    match spec {
        SelectionSpec::Keyword(k) if k == "all" => Ok(UpstreamSelection::All),
        SelectionSpec::Keyword(k) if k == "none" => Ok(UpstreamSelection::None),
        SelectionSpec::Keyword(k) if k == "previous" => Ok(UpstreamSelection::Previous),
        SelectionSpec::Names(stages) => Ok(UpstreamSelection::Stages(stages.clone())),
        SelectionSpec::Keyword(other) => Err(ConfigError::InvalidStage {
            name: stage.to_string(),
            reason: format!(
                "input.upstream must be \"all\", \"none\", \"previous\" or a list, got \"{}\"",
                other
            ),
        }),
    }
}
