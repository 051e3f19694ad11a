//! Stage registry: the ordered, read-only list of stage definitions that
//! one generic execution loop interprets.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::job::StageResult;

use super::error::RegistryError;
use super::mapping::{InputMapping, ParamSelection, UpstreamSelection};
use super::retry::RetryPolicy;
use super::stage::StageHandler;

pub const PARSE: &str = "parse";
pub const QUALITY_CONTROL: &str = "quality_control";
pub const NORMALIZE: &str = "normalize";
pub const FOLD_CHANGE: &str = "fold_change";
pub const STATISTICAL_ANALYSIS: &str = "statistical_analysis";
pub const PLOT_GENERATION: &str = "plot_generation";
pub const REPORT_BUILD: &str = "report_build";
pub const NOTIFY_COMPLETE: &str = "notify_complete";

/// Stage names of the standard analysis pipeline, in execution order.
pub const STANDARD_STAGES: [&str; 8] = [
    PARSE,
    QUALITY_CONTROL,
    NORMALIZE,
    FOLD_CHANGE,
    STATISTICAL_ANALYSIS,
    PLOT_GENERATION,
    REPORT_BUILD,
    NOTIFY_COMPLETE,
];

/// Retry policy for a stage that configures none. `parse` gets 3 attempts
/// with a 2 s base delay and multiplier 2; every other stage runs once.
pub fn default_retry(stage: &str) -> RetryPolicy {
    if stage == PARSE {
        RetryPolicy::exponential(3, Duration::from_secs(2), 2.0)
    } else {
        RetryPolicy::single_attempt()
    }
}

static RE_STAGE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// One step of the pipeline.
#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub handler: Arc<dyn StageHandler>,
    pub input: InputMapping,
    pub retry: RetryPolicy,
    /// Job progress once this stage is recorded.
    pub progress: u8,
}

impl StageDefinition {
    pub fn new(name: &str, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            name: name.to_string(),
            handler,
            input: InputMapping::default(),
            retry: RetryPolicy::single_attempt(),
            progress: 0,
        }
    }

    pub fn with_input(mut self, input: InputMapping) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress;
        self
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("retry", &self.retry)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// Validates and freezes a pipeline shape.
    ///
    /// Names must be unique identifiers, retry policies usable, and every
    /// stage named by an input mapping must come earlier in the list.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, RegistryError> {
        if stages.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &stages {
            if !RE_STAGE_NAME.is_match(&stage.name) {
                return Err(RegistryError::InvalidName(stage.name.clone()));
            }
            if stage.progress > 100 {
                return Err(RegistryError::InvalidProgress {
                    stage: stage.name.clone(),
                    progress: stage.progress,
                });
            }
            stage
                .retry
                .validate()
                .map_err(|reason| RegistryError::InvalidRetry {
                    stage: stage.name.clone(),
                    reason,
                })?;
            for reference in stage.input.referenced_stages() {
                if !seen.contains(reference.as_str()) {
                    return Err(RegistryError::NotUpstream {
                        stage: stage.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(RegistryError::DuplicateStage(stage.name.clone()));
            }
        }

        Ok(Self { stages })
    }

    /// The standard analysis pipeline with handlers supplied per stage name.
    ///
    /// Retry follows [`default_retry`].
    pub fn standard<F>(mut handler_for: F) -> Result<Self, RegistryError>
    where
        F: FnMut(&str) -> Arc<dyn StageHandler>,
    {
        let layout: [(&str, InputMapping, u8); 8] = [
            (
                PARSE,
                InputMapping::select(&["file_key", "experiment_name"], &[]),
                10,
            ),
            (
                QUALITY_CONTROL,
                InputMapping::select(&["analysis_params"], &[PARSE]),
                20,
            ),
            (
                NORMALIZE,
                InputMapping::select(&["reference_gene"], &[QUALITY_CONTROL]),
                40,
            ),
            (
                FOLD_CHANGE,
                InputMapping::select(&["control_condition"], &[NORMALIZE]),
                50,
            ),
            (
                STATISTICAL_ANALYSIS,
                InputMapping::select(&["analysis_params", "control_condition"], &[FOLD_CHANGE]),
                60,
            ),
            (
                PLOT_GENERATION,
                InputMapping::select(&["analysis_params"], &[FOLD_CHANGE, STATISTICAL_ANALYSIS]),
                70,
            ),
            (
                REPORT_BUILD,
                InputMapping::new(ParamSelection::All, UpstreamSelection::All),
                80,
            ),
            (
                NOTIFY_COMPLETE,
                InputMapping::select(&["notification", "experiment_name"], &[REPORT_BUILD]),
                90,
            ),
        ];

        let stages = layout
            .into_iter()
            .map(|(name, input, progress)| {
                StageDefinition::new(name, handler_for(name))
                    .with_input(input)
                    .with_retry(default_retry(name))
                    .with_progress(progress)
            })
            .collect();

        Self::new(stages)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Index of the first stage without a recorded result.
    ///
    /// Recorded results must be exactly the first N stages in registry
    /// order; anything else means the record was written under a different
    /// pipeline shape.
    pub fn resume_point(&self, recorded: &[StageResult]) -> Result<usize, RegistryError> {
        let matches_prefix = recorded.len() <= self.stages.len()
            && recorded
                .iter()
                .zip(&self.stages)
                .all(|(result, stage)| result.stage == stage.name);

        if !matches_prefix {
            return Err(RegistryError::InconsistentResults {
                recorded: recorded.iter().map(|r| r.stage.clone()).collect(),
            });
        }
        Ok(recorded.len())
    }
}
