//! Experiment record data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Fields that identify a physical sequencing run (besides `run_id`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowcell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Run start date, e.g. `2025-01-01` or `20250101`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Run start time, e.g. `10:00` or `1000`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl IdentityFields {
    /// True when no physical identity field carries a value.
    pub fn is_empty(&self) -> bool {
        [&self.flowcell, &self.device, &self.date, &self.time]
            .iter()
            .all(|f| f.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}

/// Fields used to pick the authoritative copy among duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingFields {
    #[serde(default)]
    pub total_reads: Option<u64>,
    #[serde(default)]
    pub total_bases: Option<u64>,
    #[serde(default)]
    pub has_pod5: bool,
    #[serde(default)]
    pub has_summary: bool,
    #[serde(default)]
    pub is_canonical: bool,
}

/// One sequencing run in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub run_id: String,
    #[serde(default)]
    pub identity: IdentityFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harmonized_name: Option<String>,
    pub canonical_path: String,
    #[serde(default)]
    pub all_paths: Vec<String>,
    #[serde(default)]
    pub ranking: RankingFields,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attributes outside the fixed schema, preserved verbatim at the top
    /// level of the record.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ExperimentRecord {
    /// New record at `canonical_path`; timestamps are stamped by the store.
    pub fn new(run_id: impl Into<String>, canonical_path: impl Into<String>) -> Self {
        let canonical_path = canonical_path.into();
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            run_id: run_id.into(),
            identity: IdentityFields::default(),
            experiment_name: None,
            harmonized_name: None,
            all_paths: if canonical_path.is_empty() {
                Vec::new()
            } else {
                vec![canonical_path.clone()]
            },
            canonical_path,
            ranking: RankingFields::default(),
            registered_at: epoch,
            updated_at: epoch,
            extra: BTreeMap::new(),
        }
    }

    /// Append `path` if it is not yet known. Returns whether it was added.
    pub fn add_path(&mut self, path: &str) -> bool {
        if path.is_empty() || self.all_paths.iter().any(|p| p == path) {
            return false;
        }
        self.all_paths.push(path.to_string());
        true
    }

    /// Ensure `canonical_path` is listed and `all_paths` has no duplicates,
    /// keeping first-seen order.
    pub fn normalize_paths(&mut self) {
        let mut seen = Vec::with_capacity(self.all_paths.len() + 1);
        if !self.canonical_path.is_empty() {
            seen.push(self.canonical_path.clone());
        }
        for path in std::mem::take(&mut self.all_paths) {
            if !path.is_empty() && !seen.contains(&path) {
                seen.push(path);
            }
        }
        self.all_paths = seen;
    }

    /// First duplicated entry in `all_paths`, if any.
    pub fn duplicate_path(&self) -> Option<&str> {
        self.all_paths
            .iter()
            .enumerate()
            .find(|(i, p)| self.all_paths[..*i].contains(*p))
            .map(|(_, p)| p.as_str())
    }

    /// Reviewable fields as `(name, value)` pairs, in a fixed order.
    ///
    /// Used for field-level diffs in proposals and events.
    pub fn field_values(&self) -> Vec<(&'static str, JsonValue)> {
        let opt = |v: &Option<String>| v.clone().map_or(JsonValue::Null, JsonValue::String);
        let num = |v: Option<u64>| v.map_or(JsonValue::Null, JsonValue::from);
        vec![
            ("flowcell", opt(&self.identity.flowcell)),
            ("device", opt(&self.identity.device)),
            ("date", opt(&self.identity.date)),
            ("time", opt(&self.identity.time)),
            ("experiment_name", opt(&self.experiment_name)),
            ("harmonized_name", opt(&self.harmonized_name)),
            ("canonical_path", JsonValue::String(self.canonical_path.clone())),
            ("all_paths", JsonValue::from(self.all_paths.clone())),
            ("total_reads", num(self.ranking.total_reads)),
            ("total_bases", num(self.ranking.total_bases)),
            ("has_pod5", JsonValue::Bool(self.ranking.has_pod5)),
            ("has_summary", JsonValue::Bool(self.ranking.has_summary)),
            ("is_canonical", JsonValue::Bool(self.ranking.is_canonical)),
        ]
    }

    /// Set a reviewable field from its JSON value.
    ///
    /// Returns `false` when the field name is unknown or the value has the
    /// wrong shape; the record is left unchanged in that case.
    pub fn set_field(&mut self, field: &str, value: &JsonValue) -> bool {
        fn string(value: &JsonValue) -> Option<Option<String>> {
            match value {
                JsonValue::Null => Some(None),
                JsonValue::String(s) => Some(Some(s.clone())),
                _ => None,
            }
        }
        fn count(value: &JsonValue) -> Option<Option<u64>> {
            match value {
                JsonValue::Null => Some(None),
                other => other.as_u64().map(Some),
            }
        }

        let applied = match field {
            "flowcell" => string(value).map(|v| self.identity.flowcell = v),
            "device" => string(value).map(|v| self.identity.device = v),
            "date" => string(value).map(|v| self.identity.date = v),
            "time" => string(value).map(|v| self.identity.time = v),
            "experiment_name" => string(value).map(|v| self.experiment_name = v),
            "harmonized_name" => string(value).map(|v| self.harmonized_name = v),
            "canonical_path" => value.as_str().map(|v| {
                self.canonical_path = v.to_string();
                self.normalize_paths();
            }),
            "total_reads" => count(value).map(|v| self.ranking.total_reads = v),
            "total_bases" => count(value).map(|v| self.ranking.total_bases = v),
            "has_pod5" => value.as_bool().map(|v| self.ranking.has_pod5 = v),
            "has_summary" => value.as_bool().map(|v| self.ranking.has_summary = v),
            "is_canonical" => value.as_bool().map(|v| self.ranking.is_canonical = v),
            _ => None,
        };
        applied.is_some()
    }
}

/// A single field change, shared by proposals and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: JsonValue,
    pub after: JsonValue,
}

/// Field-level diff between two versions of a record.
pub fn diff_records(before: &ExperimentRecord, after: &ExperimentRecord) -> Vec<FieldChange> {
    before
        .field_values()
        .into_iter()
        .zip(after.field_values())
        .filter(|((_, b), (_, a))| a != b)
        .map(|((field, b), (_, a))| FieldChange {
            field: field.to_string(),
            before: b,
            after: a,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn add_path_ignores_duplicates() {
        let mut record = ExperimentRecord::new("ab12cd34", "/data/run1");
        assert!(record.add_path("/data/run1_copy"));
        assert!(!record.add_path("/data/run1"));
        assert!(!record.add_path("/data/run1_copy"));
        assert_eq!(record.all_paths, vec!["/data/run1", "/data/run1_copy"]);
    }

    #[test]
    fn normalize_puts_canonical_first_once() {
        let mut record = ExperimentRecord::new("r1", "/b");
        record.all_paths = vec!["/a".into(), "/b".into(), "/a".into()];
        record.normalize_paths();
        assert_eq!(record.all_paths, vec!["/b", "/a"]);
        assert_eq!(record.duplicate_path(), None);
    }

    #[test]
    fn set_field_rejects_wrong_shape() {
        let mut record = ExperimentRecord::new("r1", "/a");
        assert!(record.set_field("total_reads", &json!(5000)));
        assert!(!record.set_field("total_reads", &json!("many")));
        assert!(!record.set_field("run_id", &json!("other")));
        assert_eq!(record.ranking.total_reads, Some(5000));
        assert_eq!(record.run_id, "r1");
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let before = ExperimentRecord::new("r1", "/a");
        let mut after = before.clone();
        after.ranking.total_reads = Some(10);
        after.add_path("/b");

        let changes = diff_records(&before, &after);
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["all_paths", "total_reads"]);
        assert_eq!(changes[1].before, JsonValue::Null);
        assert_eq!(changes[1].after, json!(10));
    }

    #[test]
    fn unknown_keys_survive_in_extra() {
        let raw = json!({
            "run_id": "r1",
            "canonical_path": "/a",
            "all_paths": ["/a"],
            "registered_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "sample_type": "cfDNA"
        });
        let record: ExperimentRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra.get("sample_type"), Some(&json!("cfDNA")));
        assert_eq!(record.extra.len(), 1);

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["sample_type"], "cfDNA");
        assert!(written.get("extra").is_none());
    }
}
