//! Raw discovery candidates and the candidate-batch file.
//!
//! The external scanner emits one JSON object per discovered run directory.
//! Only `canonical_path` is required; everything else is whatever the scanner
//! could recover from summary files, POD5 headers or path heuristics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{RegistryError, Result};
use crate::identity::derived_run_id;
use crate::io::write_json_atomic;
use crate::record::{ExperimentRecord, IdentityFields, RankingFields};

/// One scanner result, as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    #[serde(default)]
    pub canonical_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowcell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harmonized_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_reads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bases: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_pod5: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_summary: Option<bool>,
    /// Why the scanner item could not be read. Set by [`CandidateBatch::parse`]
    /// so one malformed item is reported instead of failing the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_error: Option<String>,
    /// Any keys outside the known schema.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Key under which an unreadable item's original JSON is kept.
const REJECTED_INPUT_KEY: &str = "rejected_input";

impl RawCandidate {
    /// Placeholder for a scanner item that did not match the schema.
    pub fn rejected(input: JsonValue, reason: impl Into<String>) -> Self {
        let canonical_path = input
            .get("canonical_path")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let mut extra = BTreeMap::new();
        extra.insert(REJECTED_INPUT_KEY.to_string(), input);
        Self {
            canonical_path,
            intake_error: Some(reason.into()),
            extra,
            ..Default::default()
        }
    }

    /// Convert one scanner item, keeping it as a rejected placeholder when
    /// it does not deserialize.
    pub fn from_item(input: JsonValue) -> Self {
        match RawCandidate::deserialize(&input) {
            Ok(candidate) => candidate,
            Err(err) => RawCandidate::rejected(input, err.to_string()),
        }
    }

    pub fn identity(&self) -> IdentityFields {
        IdentityFields {
            flowcell: clean(&self.flowcell),
            device: clean(&self.device),
            date: clean(&self.date),
            time: clean(&self.time),
        }
    }

    /// Explicit run id, if the scanner recovered one.
    pub fn explicit_run_id(&self) -> Option<String> {
        clean(&self.run_id)
    }
}

/// A candidate that passed intake, with its resolved run id.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedCandidate {
    pub run_id: String,
    /// Whether `run_id` was synthesized from identity fields.
    pub derived_run_id: bool,
    pub identity: IdentityFields,
    /// Position in the scanner output.
    pub discovery_index: usize,
    pub raw: RawCandidate,
}

impl IdentifiedCandidate {
    /// The record this candidate would register, before store stamping.
    pub fn to_record(&self) -> ExperimentRecord {
        let mut record = ExperimentRecord::new(self.run_id.clone(), self.raw.canonical_path.trim());
        record.identity = self.identity.clone();
        record.experiment_name = clean(&self.raw.experiment_name);
        record.harmonized_name = clean(&self.raw.harmonized_name);
        record.ranking = RankingFields {
            total_reads: self.raw.total_reads,
            total_bases: self.raw.total_bases,
            has_pod5: self.raw.has_pod5.unwrap_or(false),
            has_summary: self.raw.has_summary.unwrap_or(false),
            is_canonical: false,
        };
        record.extra = self.raw.extra.clone();
        if self.derived_run_id {
            record
                .extra
                .insert("run_id_derived".to_string(), JsonValue::Bool(true));
        }
        record
    }
}

/// A candidate excluded before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnidentifiableCandidate {
    pub canonical_path: String,
    pub discovery_index: usize,
    pub reason: String,
}

/// Intake split of a scanner batch.
#[derive(Debug, Clone, Default)]
pub struct Intake {
    pub identified: Vec<IdentifiedCandidate>,
    pub unidentifiable: Vec<UnidentifiableCandidate>,
}

/// Separate usable candidates from ones with no identity at all.
pub fn intake(candidates: &[RawCandidate]) -> Intake {
    let mut out = Intake::default();
    for (index, raw) in candidates.iter().enumerate() {
        let path = raw.canonical_path.trim();
        if let Some(error) = &raw.intake_error {
            tracing::warn!(index, %error, "candidate could not be read");
            out.unidentifiable.push(UnidentifiableCandidate {
                canonical_path: path.to_string(),
                discovery_index: index,
                reason: format!("invalid candidate: {error}"),
            });
            continue;
        }
        if path.is_empty() {
            tracing::warn!(index, "candidate without canonical_path");
            out.unidentifiable.push(UnidentifiableCandidate {
                canonical_path: String::new(),
                discovery_index: index,
                reason: "missing canonical_path".to_string(),
            });
            continue;
        }

        let identity = raw.identity();
        let resolved = match raw.explicit_run_id() {
            Some(run_id) => Some((run_id, false)),
            None => derived_run_id(&identity).map(|id| (id, true)),
        };
        let Some((run_id, derived)) = resolved else {
            tracing::warn!(path, "candidate has no recoverable identity fields");
            out.unidentifiable.push(UnidentifiableCandidate {
                canonical_path: path.to_string(),
                discovery_index: index,
                reason: "no identity fields recovered (run_id, flowcell, device, date, time)"
                    .to_string(),
            });
            continue;
        };

        out.identified.push(IdentifiedCandidate {
            run_id,
            derived_run_id: derived,
            identity,
            discovery_index: index,
            raw: raw.clone(),
        });
    }
    out
}

/// A persisted scanner batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub scan_id: String,
    pub scanned_at: DateTime<Utc>,
    /// Free-form description of where the batch came from.
    #[serde(default)]
    pub source: JsonValue,
    pub candidates: Vec<RawCandidate>,
}

#[derive(Deserialize)]
struct BatchHeader {
    scan_id: String,
    scanned_at: DateTime<Utc>,
    #[serde(default)]
    source: JsonValue,
}

/// Filename prefix for persisted candidate batches.
pub const CANDIDATES_PREFIX: &str = "candidates_";

impl CandidateBatch {
    pub fn new(scanned_at: DateTime<Utc>, source: JsonValue, candidates: Vec<RawCandidate>) -> Self {
        Self {
            scan_id: format!("scan_{}", scanned_at.format("%Y%m%d_%H%M%S")),
            scanned_at,
            source,
            candidates,
        }
    }

    /// Parse scanner output: a batch object, a bare array, or JSON lines.
    ///
    /// Only a file that cannot be split into items is an error. Items that do
    /// not match the candidate schema become rejected placeholders which
    /// intake reports as unidentifiable.
    pub fn parse(content: &str, origin: &Path, fallback_time: DateTime<Utc>) -> Result<Self> {
        let invalid = |reason: String| RegistryError::CandidateFile {
            path: origin.to_path_buf(),
            reason,
        };
        let trimmed = content.trim_start();

        if trimmed.starts_with('[') {
            let items: Vec<JsonValue> =
                serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
            let candidates = items.into_iter().map(RawCandidate::from_item).collect();
            return Ok(Self::new(fallback_time, origin_source(origin), candidates));
        }

        if trimmed.starts_with('{')
            && let Ok(JsonValue::Object(mut map)) = serde_json::from_str::<JsonValue>(content)
        {
            let Some(items) = map.remove("candidates") else {
                let single = RawCandidate::from_item(JsonValue::Object(map));
                return Ok(Self::new(fallback_time, origin_source(origin), vec![single]));
            };
            let JsonValue::Array(items) = items else {
                return Err(invalid("`candidates` is not an array".to_string()));
            };
            let header: BatchHeader = serde_json::from_value(JsonValue::Object(map))
                .map_err(|e| invalid(e.to_string()))?;
            return Ok(Self {
                scan_id: header.scan_id,
                scanned_at: header.scanned_at,
                source: header.source,
                candidates: items.into_iter().map(RawCandidate::from_item).collect(),
            });
        }

        let candidates = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| match serde_json::from_str::<JsonValue>(line) {
                Ok(item) => RawCandidate::from_item(item),
                Err(e) => RawCandidate::rejected(
                    JsonValue::String(line.to_string()),
                    format!("line {}: {e}", i + 1),
                ),
            })
            .collect();
        Ok(Self::new(fallback_time, origin_source(origin), candidates))
    }

    /// Read a candidate file from disk. Files without a batch header are
    /// stamped with their modification time, so re-reading one is stable.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::io(path, e))?;
        let modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Self::parse(&content, path, modified)
    }

    pub fn file_name(&self) -> String {
        format!(
            "{CANDIDATES_PREFIX}{}.json",
            self.scanned_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write into `dir` under its timestamped name. Returns the path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        write_json_atomic(&path, self)?;
        Ok(path)
    }
}

fn origin_source(origin: &Path) -> JsonValue {
    serde_json::json!({ "imported_from": origin.display().to_string() })
}

/// Most recent candidate file in `dir` by timestamped name.
pub fn latest_candidate_file(dir: &Path) -> Result<Option<PathBuf>> {
    crate::proposal::latest_with_prefix(dir, CANDIDATES_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawCandidate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unknown_keys_are_kept_as_extra() {
        let candidate = raw(json!({
            "canonical_path": "/data/run1",
            "run_id": "ab12cd34",
            "sample_id": "S7"
        }));
        assert_eq!(candidate.extra.get("sample_id"), Some(&json!("S7")));
    }

    #[test]
    fn intake_rejects_candidates_without_identity() {
        let batch = vec![
            raw(json!({"canonical_path": "/data/mystery"})),
            raw(json!({"canonical_path": "/data/run1", "run_id": "r1"})),
            raw(json!({"canonical_path": "  ", "run_id": "r2"})),
            raw(json!({"canonical_path": "/data/blank", "flowcell": "  "})),
        ];
        let result = intake(&batch);

        assert_eq!(result.identified.len(), 1);
        assert_eq!(result.identified[0].run_id, "r1");
        let paths: Vec<&str> = result
            .unidentifiable
            .iter()
            .map(|u| u.canonical_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/data/mystery", "", "/data/blank"]);
    }

    #[test]
    fn intake_derives_run_id_from_identity() {
        let batch = vec![raw(json!({
            "canonical_path": "/data/run1",
            "flowcell": "FAW12345",
            "device": "MN1"
        }))];
        let result = intake(&batch);
        let candidate = &result.identified[0];
        assert!(candidate.derived_run_id);
        assert!(candidate.run_id.starts_with("derived-"));

        let record = candidate.to_record();
        assert_eq!(record.extra.get("run_id_derived"), Some(&json!(true)));
        assert_eq!(record.all_paths, vec!["/data/run1"]);
    }

    #[test]
    fn parse_accepts_array_batch_and_lines() {
        let origin = Path::new("/tmp/scan.out");
        let now = Utc::now();

        let array = r#"[{"canonical_path": "/a", "run_id": "r1"}]"#;
        assert_eq!(CandidateBatch::parse(array, origin, now).unwrap().candidates.len(), 1);

        let lines = "{\"canonical_path\": \"/a\"}\n\n{\"canonical_path\": \"/b\"}\n";
        assert_eq!(CandidateBatch::parse(lines, origin, now).unwrap().candidates.len(), 2);

        let batch = CandidateBatch::new(now, JsonValue::Null, vec![RawCandidate::default()]);
        let text = serde_json::to_string(&batch).unwrap();
        let parsed = CandidateBatch::parse(&text, origin, now).unwrap();
        assert_eq!(parsed.scan_id, batch.scan_id);
    }

    #[test]
    fn bad_line_is_rejected_not_fatal() {
        let batch = CandidateBatch::parse(
            "{\"canonical_path\": \"/a\", \"run_id\": \"r1\"}\n{oops\n",
            Path::new("/tmp/scan.out"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(batch.candidates.len(), 2);

        let result = intake(&batch.candidates);
        assert_eq!(result.identified.len(), 1);
        assert_eq!(result.unidentifiable.len(), 1);
        assert_eq!(result.unidentifiable[0].discovery_index, 1);
        assert!(result.unidentifiable[0].reason.contains("line 2"));
    }

    #[test]
    fn mistyped_item_does_not_sink_the_batch() {
        let content = json!([
            {"canonical_path": "/data/r1", "run_id": "r1", "total_reads": 1234},
            {"canonical_path": "/data/r2", "run_id": "r2", "total_reads": 1234.0}
        ])
        .to_string();
        let batch = CandidateBatch::parse(&content, Path::new("/tmp/scan.json"), Utc::now()).unwrap();

        let result = intake(&batch.candidates);
        let ids: Vec<&str> = result.identified.iter().map(|c| c.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
        let rejected = &result.unidentifiable[0];
        assert_eq!(rejected.canonical_path, "/data/r2");
        assert!(rejected.reason.starts_with("invalid candidate:"));

        // The rejected item keeps its input when the batch is persisted.
        let text = serde_json::to_string(&batch).unwrap();
        let reread = CandidateBatch::parse(&text, Path::new("/tmp/batch.json"), Utc::now()).unwrap();
        assert_eq!(reread.candidates, batch.candidates);
    }

    #[test]
    fn batch_header_is_still_required() {
        let err = CandidateBatch::parse(
            r#"{"candidates": [], "scanned_at": "not a time"}"#,
            Path::new("/tmp/batch.json"),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::CandidateFile { .. }));
    }

    #[test]
    fn harmonized_name_reaches_the_record() {
        let batch = vec![raw(json!({
            "canonical_path": "/data/run1",
            "run_id": "r1",
            "experiment_name": "20250101_pilot_v2",
            "harmonized_name": "pilot"
        }))];
        let record = intake(&batch).identified[0].to_record();
        assert_eq!(record.harmonized_name.as_deref(), Some("pilot"));
        assert!(record.extra.is_empty());
    }
}
