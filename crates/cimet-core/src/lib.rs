//! Core domain model for the CI test-metrics pipeline.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "cimet-core";

/// Aggregate result counters carried on every run record.
///
/// The upstream service omits counters that are zero, so every field
/// defaults to 0 on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pass: u64,
    #[serde(default)]
    pub fail: u64,
    #[serde(default)]
    pub dead: u64,
    #[serde(default)]
    pub waiting: u64,
    #[serde(default)]
    pub queued: u64,
    #[serde(default)]
    pub running: u64,
}

/// Job identifier as handed out by the metadata service.
///
/// The service is inconsistent about the JSON type: older records carry
/// numbers, newer ones strings. Both normalize to the string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Self(s)),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "job_id must be a string or number, got {other}"
            ))),
        }
    }
}

/// One CI execution encompassing multiple jobs, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub posted: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// References to the run's job collection; the first entry is followed.
    #[serde(default)]
    pub href: Vec<String>,
    #[serde(default)]
    pub results: ResultCounts,
    /// Replaced wholesale on every ingestion of this run.
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One test case within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub log_href: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    pub fn failed(&self) -> bool {
        self.status.as_deref() == Some("fail")
    }
}

/// A generalized failure template that many similar messages map to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: u64,
    pub template: Vec<String>,
    pub match_count: u64,
}

impl Cluster {
    pub fn template_text(&self) -> String {
        self.template.join(" ")
    }
}

/// One line of a job's console log, written in batches and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub job_id: JobId,
    pub seq: usize,
    pub text: String,
}

/// Normalized shape for the duck-typed fields the metadata service emits
/// with inconsistent JSON types between records.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeField {
    Text(String),
    List(Vec<Value>),
    Object(Map<String, Value>),
}

impl ShapeField {
    /// Classify a raw JSON value. Object values pass through; null maps
    /// to the empty object so the index never sees a type flip.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items),
            Value::Object(map) => Self::Object(map),
            Value::Null => Self::Object(Map::new()),
            other => Self::Text(other.to_string()),
        }
    }

    /// Render in the single shape stored in the index: always an object.
    pub fn normalize(self) -> Value {
        match self {
            Self::Text(s) => {
                let mut map = Map::new();
                map.insert("value".to_string(), Value::String(s));
                Value::Object(map)
            }
            Self::List(items) => {
                let mut map = Map::new();
                map.insert("items".to_string(), Value::Array(items));
                Value::Object(map)
            }
            Self::Object(map) => Value::Object(map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_accepts_string_or_number() {
        let from_str: JobRecord = serde_json::from_value(json!({"job_id": "7854231"})).unwrap();
        let from_num: JobRecord = serde_json::from_value(json!({"job_id": 7854231})).unwrap();
        assert_eq!(from_str.job_id, from_num.job_id);
        assert_eq!(from_str.job_id.to_string(), "7854231");
    }

    #[test]
    fn run_record_keeps_unknown_fields() {
        let run: RunRecord = serde_json::from_value(json!({
            "name": "user-2024-01-01_01:00:00-rados-main",
            "branch": "main",
            "results": {"total": 10, "pass": 8, "fail": 2},
            "machine_type": "smithi",
        }))
        .unwrap();
        assert_eq!(run.results.pass, 8);
        assert_eq!(run.results.running, 0);
        assert_eq!(run.extra["machine_type"], json!("smithi"));
    }

    #[test]
    fn shape_field_normalizes_every_input_shape_to_an_object() {
        assert_eq!(
            ShapeField::from_value(json!(null)).normalize(),
            json!({})
        );
        assert_eq!(
            ShapeField::from_value(json!("x")).normalize(),
            json!({"value": "x"})
        );
        assert_eq!(
            ShapeField::from_value(json!([1, 2])).normalize(),
            json!({"items": [1, 2]})
        );
        assert_eq!(
            ShapeField::from_value(json!({"k": "v"})).normalize(),
            json!({"k": "v"})
        );
    }
}
