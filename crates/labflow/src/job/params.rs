//! Admission payload carried on every job.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_REFERENCE_GENE: &str = "GAPDH";
pub const DEFAULT_CONTROL_CONDITION: &str = "CONTROL";

/// Notification preferences supplied at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_notification: bool,
}

impl NotificationPrefs {
    pub fn email(address: &str) -> Self {
        Self {
            email: Some(address.to_string()),
            email_notification: true,
        }
    }
}

/// The original admission payload. Immutable once the job is admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputParams {
    /// Storage key of the raw input file.
    pub file_key: String,
    #[serde(default = "default_reference_gene")]
    pub reference_gene: String,
    #[serde(default = "default_control_condition")]
    pub control_condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub analysis_params: Map<String, Value>,
    #[serde(default)]
    pub notification: NotificationPrefs,
}

fn default_reference_gene() -> String {
    DEFAULT_REFERENCE_GENE.to_string()
}

fn default_control_condition() -> String {
    DEFAULT_CONTROL_CONDITION.to_string()
}

impl InputParams {
    /// Parameters for `file_key` with every other field at its default.
    pub fn new(file_key: &str) -> Self {
        Self {
            file_key: file_key.to_string(),
            reference_gene: default_reference_gene(),
            control_condition: default_control_condition(),
            experiment_name: None,
            analysis_params: Map::new(),
            notification: NotificationPrefs::default(),
        }
    }

    /// JSON object form, used for input projection.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_apply_on_deserialize() {
        let params: InputParams = serde_json::from_value(json!({ "file_key": "raw/u1/a.csv" })).unwrap();
        assert_eq!(params.reference_gene, "GAPDH");
        assert_eq!(params.control_condition, "CONTROL");
        assert!(params.analysis_params.is_empty());
        assert!(!params.notification.email_notification);
    }

    #[test]
    fn test_to_value_has_top_level_keys() {
        let mut params = InputParams::new("raw/u1/a.csv");
        params.notification = NotificationPrefs::email("a@b.org");
        let value = params.to_value();
        assert_eq!(value["file_key"], "raw/u1/a.csv");
        assert_eq!(value["notification"]["email"], "a@b.org");
        assert_eq!(value["notification"]["email_notification"], true);
        assert!(value.get("experiment_name").is_none());
    }
}
