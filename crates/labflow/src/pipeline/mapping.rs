//! Input-mapping rules: which parts of the stage envelope and the admission
//! parameters a stage gets to see.

use serde_json::{json, Map, Value};

use crate::job::{InputParams, StageResult};

use super::error::MappingError;

/// Which admission parameters are visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ParamSelection {
    #[default]
    All,
    None,
    /// Only these top-level keys. Keys absent from the parameters are
    /// left out of the projection.
    Keys(Vec<String>),
}

/// Which upstream stage results are visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpstreamSelection {
    /// Every recorded upstream result.
    All,
    None,
    /// The most recently recorded result, if any.
    #[default]
    Previous,
    /// These stages, each of which must be recorded.
    Stages(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputMapping {
    pub params: ParamSelection,
    pub upstream: UpstreamSelection,
}

impl InputMapping {
    pub fn new(params: ParamSelection, upstream: UpstreamSelection) -> Self {
        Self { params, upstream }
    }

    /// Selects parameter keys and named upstream stages.
    pub fn select(params: &[&str], upstream: &[&str]) -> Self {
        let params = ParamSelection::Keys(params.iter().map(|s| s.to_string()).collect());
        let upstream = if upstream.is_empty() {
            UpstreamSelection::None
        } else {
            UpstreamSelection::Stages(upstream.iter().map(|s| s.to_string()).collect())
        };
        Self { params, upstream }
    }

    /// Stage names this mapping reads explicitly.
    pub fn referenced_stages(&self) -> &[String] {
        match &self.upstream {
            UpstreamSelection::Stages(names) => names,
            _ => &[],
        }
    }

    /// Builds the handler input:
    /// `{"job_id", "stage", "params": {..}, "upstream": {name: output}}`.
    ///
    /// `upstream` must only contain results of stages ordered before `stage`.
    pub fn project(
        &self,
        job_id: &str,
        stage: &str,
        params: &InputParams,
        upstream: &[StageResult],
    ) -> Result<Value, MappingError> {
        let mut input = json!({ "job_id": job_id, "stage": stage });

        if let Some(selected) = self.project_params(params) {
            input["params"] = Value::Object(selected);
        }
        if let Some(selected) = self.project_upstream(stage, upstream)? {
            input["upstream"] = Value::Object(selected);
        }
        Ok(input)
    }

    fn project_params(&self, params: &InputParams) -> Option<Map<String, Value>> {
        let Value::Object(all) = params.to_value() else {
            return Some(Map::new());
        };
        match &self.params {
            ParamSelection::All => Some(all),
            ParamSelection::None => None,
            ParamSelection::Keys(keys) => Some(
                keys.iter()
                    .filter_map(|k| all.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
            ),
        }
    }

    fn project_upstream(
        &self,
        stage: &str,
        upstream: &[StageResult],
    ) -> Result<Option<Map<String, Value>>, MappingError> {
        let entry = |r: &StageResult| (r.stage.clone(), r.output.clone());
        let selected = match &self.upstream {
            UpstreamSelection::None => return Ok(None),
            UpstreamSelection::All => upstream.iter().map(entry).collect(),
            UpstreamSelection::Previous => upstream.last().map(entry).into_iter().collect(),
            UpstreamSelection::Stages(names) => {
                let mut map = Map::new();
                for name in names {
                    let result = upstream.iter().find(|r| &r.stage == name).ok_or_else(|| {
                        MappingError::MissingUpstream {
                            stage: stage.to_string(),
                            upstream: name.clone(),
                        }
                    })?;
                    map.insert(name.clone(), result.output.clone());
                }
                map
            }
        };
        Ok(Some(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(stage: &str, output: Value) -> StageResult {
        StageResult {
            stage: stage.to_string(),
            output,
            attempts: 1,
            recorded_at: Utc::now(),
        }
    }

    fn envelope() -> Vec<StageResult> {
        vec![
            result("parse", json!({ "samples": 12 })),
            result("quality_control", json!({ "passed": true })),
        ]
    }

    #[test]
    fn test_select_projects_named_keys_and_stages() {
        let mapping = InputMapping::select(&["reference_gene", "experiment_name"], &["parse"]);
        let params = InputParams::new("raw/u/a.csv");

        let input = mapping
            .project("j1", "normalize", &params, &envelope())
            .unwrap();

        assert_eq!(input["job_id"], "j1");
        assert_eq!(input["stage"], "normalize");
        assert_eq!(input["params"], json!({ "reference_gene": "GAPDH" }));
        assert_eq!(input["upstream"], json!({ "parse": { "samples": 12 } }));
    }

    #[test]
    fn test_previous_sees_only_last_result() {
        let mapping = InputMapping::new(ParamSelection::None, UpstreamSelection::Previous);
        let input = mapping
            .project("j1", "normalize", &InputParams::new("k"), &envelope())
            .unwrap();

        assert!(input.get("params").is_none());
        assert_eq!(input["upstream"], json!({ "quality_control": { "passed": true } }));
    }

    #[test]
    fn test_previous_on_first_stage_is_empty() {
        let mapping = InputMapping::default();
        let input = mapping
            .project("j1", "parse", &InputParams::new("k"), &[])
            .unwrap();
        assert_eq!(input["upstream"], json!({}));
        assert_eq!(input["params"]["file_key"], "k");
    }

    #[test]
    fn test_all_upstream() {
        let mapping = InputMapping::new(ParamSelection::None, UpstreamSelection::All);
        let input = mapping
            .project("j1", "report_build", &InputParams::new("k"), &envelope())
            .unwrap();
        let upstream = input["upstream"].as_object().unwrap();
        assert_eq!(upstream.len(), 2);
    }

    #[test]
    fn test_missing_named_upstream_is_an_error() {
        let mapping = InputMapping::select(&[], &["normalize"]);
        let err = mapping
            .project("j1", "fold_change", &InputParams::new("k"), &envelope())
            .unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingUpstream {
                stage: "fold_change".to_string(),
                upstream: "normalize".to_string()
            }
        );
    }
}
