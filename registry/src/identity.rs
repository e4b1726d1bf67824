//! Identity keys, fingerprints and ranking.
//!
//! Two hashes are derived from a record's identity fields:
//!
//! - [`fingerprint`] covers `flowcell|device|date|time|run_id` and pins the
//!   exact identity a proposal was computed against.
//! - [`dedup_key`] covers only the four physical fields. Two distinct run ids
//!   sharing a dedup key are probably the same run captured twice, and are
//!   surfaced as merge candidates.
//!
//! Missing fields hash as empty strings, so partial records still get a
//! deterministic key.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::{ExperimentRecord, IdentityFields, RankingFields};

/// Delimiter between identity fields in the canonical key.
pub const KEY_DELIMITER: &str = "|";

/// Hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Prefix for run ids synthesized from identity fields.
pub const DERIVED_RUN_ID_PREFIX: &str = "derived-";

/// Short stable hash of identity fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_key(key: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    Fingerprint(hex)
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or_default()
}

fn physical_key(identity: &IdentityFields) -> String {
    [
        field(&identity.flowcell),
        field(&identity.device),
        field(&identity.date),
        field(&identity.time),
    ]
    .join(KEY_DELIMITER)
}

/// Canonical identity key: `flowcell|device|date|time|run_id`.
pub fn identity_key(identity: &IdentityFields, run_id: &str) -> String {
    format!("{}{KEY_DELIMITER}{}", physical_key(identity), run_id.trim())
}

/// Fingerprint over all five identity fields.
pub fn fingerprint_of(identity: &IdentityFields, run_id: &str) -> Fingerprint {
    hash_key(&identity_key(identity, run_id))
}

/// Fingerprint of a stored record.
pub fn fingerprint(record: &ExperimentRecord) -> Fingerprint {
    fingerprint_of(&record.identity, &record.run_id)
}

/// Collision key over the run-independent identity fields.
///
/// `None` when all four fields are empty: such records carry no physical
/// identity to collide on.
pub fn dedup_key(identity: &IdentityFields) -> Option<Fingerprint> {
    if identity.is_empty() {
        None
    } else {
        Some(hash_key(&physical_key(identity)))
    }
}

/// Stable run id for a candidate that carries identity fields but no run id.
pub fn derived_run_id(identity: &IdentityFields) -> Option<String> {
    dedup_key(identity).map(|key| format!("{DERIVED_RUN_ID_PREFIX}{key}"))
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%H%M%S", "%H%M"];

/// Run start parsed from the date/time identity fields.
///
/// A missing time counts as midnight; an unparseable date yields `None`.
pub fn started_at(identity: &IdentityFields) -> Option<NaiveDateTime> {
    let date_str = identity.date.as_deref()?.trim();
    let date = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_str, fmt).ok())?;
    let time = match identity.time.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => TIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(t, fmt).ok())?,
        _ => NaiveTime::MIN,
    };
    Some(date.and_time(time))
}

/// Everything the ranking heuristic looks at for one side of a comparison.
#[derive(Debug, Clone)]
pub struct RankKey<'a> {
    pub ranking: &'a RankingFields,
    pub identity: &'a IdentityFields,
    /// `None` for candidates not yet in the store.
    pub registered_at: Option<DateTime<Utc>>,
    /// Position in discovery order; breaks the final tie.
    pub discovery_index: usize,
}

/// Ranking order for choosing the canonical copy: `Less` means `a` wins.
///
/// Most reads, then most recent start, then first registered, then first
/// discovered.
pub fn rank_order(a: &RankKey<'_>, b: &RankKey<'_>) -> Ordering {
    let reads = |k: &RankKey<'_>| k.ranking.total_reads.unwrap_or(0);
    reads(b)
        .cmp(&reads(a))
        .then_with(|| started_at(b.identity).cmp(&started_at(a.identity)))
        .then_with(|| match (a.registered_at, b.registered_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.discovery_index.cmp(&b.discovery_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(flowcell: &str, device: &str, date: &str, time: &str) -> IdentityFields {
        IdentityFields {
            flowcell: Some(flowcell.to_string()),
            device: Some(device.to_string()),
            date: Some(date.to_string()),
            time: Some(time.to_string()),
        }
    }

    #[test]
    fn identity_key_orders_fields() {
        let id = identity("FAW12345", "MN1", "2025-01-01", "10:00");
        assert_eq!(
            identity_key(&id, "ab12cd34"),
            "FAW12345|MN1|2025-01-01|10:00|ab12cd34"
        );
    }

    #[test]
    fn missing_fields_hash_as_empty() {
        let partial = IdentityFields {
            flowcell: Some("FAW12345".to_string()),
            ..Default::default()
        };
        assert_eq!(identity_key(&partial, "r1"), "FAW12345||||r1");
        let fp = fingerprint_of(&partial, "r1");
        assert_eq!(fp.as_str().len(), FINGERPRINT_LEN);
        assert_eq!(fp, fingerprint_of(&partial.clone(), "r1"));
    }

    #[test]
    fn fingerprint_ignores_non_identity_fields() {
        let mut a = ExperimentRecord::new("r1", "/a");
        a.identity = identity("FC1", "MN1", "2025-01-01", "10:00");
        let mut b = ExperimentRecord::new("r1", "/somewhere/else");
        b.ranking.total_reads = Some(99);
        b.experiment_name = Some("other".to_string());
        b.identity = identity("FC1", "MN1", "2025-01-01", "10:00");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_stable_under_field_order_in_input() {
        let a: IdentityFields = serde_json::from_str(
            r#"{"flowcell":"FC1","device":"MN1","date":"2025-01-01","time":"10:00"}"#,
        )
        .unwrap();
        let b: IdentityFields = serde_json::from_str(
            r#"{"time":"10:00","date":"2025-01-01","device":"MN1","flowcell":"FC1"}"#,
        )
        .unwrap();
        assert_eq!(fingerprint_of(&a, "r1"), fingerprint_of(&b, "r1"));
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn dedup_key_excludes_run_id() {
        let id = identity("FC1", "MN1", "2025-01-01", "10:00");
        assert_ne!(fingerprint_of(&id, "a"), fingerprint_of(&id, "b"));
        assert!(dedup_key(&id).is_some());
        assert_eq!(dedup_key(&IdentityFields::default()), None);
    }

    #[test]
    fn derived_run_id_is_stable() {
        let id = identity("FC1", "MN1", "2025-01-01", "10:00");
        let first = derived_run_id(&id).unwrap();
        assert!(first.starts_with(DERIVED_RUN_ID_PREFIX));
        assert_eq!(Some(first), derived_run_id(&id));
    }

    #[test]
    fn started_at_accepts_compact_formats() {
        let a = started_at(&identity("FC", "D", "20250101", "1000")).unwrap();
        let b = started_at(&identity("FC", "D", "2025-01-01", "10:00")).unwrap();
        assert_eq!(a, b);
        assert!(started_at(&identity("FC", "D", "yesterday", "10:00")).is_none());
    }

    #[test]
    fn rank_prefers_reads_then_recency_then_registration() {
        let low = RankingFields {
            total_reads: Some(1000),
            ..Default::default()
        };
        let high = RankingFields {
            total_reads: Some(5000),
            ..Default::default()
        };
        let early = identity("FC", "D", "2025-01-01", "10:00");
        let late = identity("FC", "D", "2025-01-02", "10:00");

        let a = RankKey {
            ranking: &low,
            identity: &late,
            registered_at: Some(DateTime::<Utc>::UNIX_EPOCH),
            discovery_index: 0,
        };
        let b = RankKey {
            ranking: &high,
            identity: &early,
            registered_at: None,
            discovery_index: 1,
        };
        assert_eq!(rank_order(&a, &b), Ordering::Greater);

        let c = RankKey {
            ranking: &low,
            identity: &early,
            registered_at: None,
            discovery_index: 2,
        };
        assert_eq!(rank_order(&a, &c), Ordering::Less);

        let d = RankKey {
            ranking: &low,
            identity: &late,
            registered_at: None,
            discovery_index: 3,
        };
        assert_eq!(rank_order(&a, &d), Ordering::Less);
    }
}
