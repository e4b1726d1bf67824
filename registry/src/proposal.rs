//! Reviewable reconciliation proposals.
//!
//! A proposal is produced by [`crate::reconcile::reconcile`], written to the
//! proposals directory, reviewed by an operator and consumed by
//! [`crate::apply::apply`]. Applied items keep an `applied` marker so a
//! replayed apply is a no-op; proposal files are never deleted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::candidates::UnidentifiableCandidate;
use crate::error::{RegistryError, Result};
use crate::identity::Fingerprint;
use crate::io::write_json_atomic;
use crate::record::{ExperimentRecord, FieldChange};

/// Filename prefix for persisted proposals.
pub const PROPOSAL_PREFIX: &str = "proposal_";

/// Lifecycle of a proposal file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    PartiallyApplied,
    Applied,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PartiallyApplied => "partially-applied",
            Self::Applied => "applied",
        }
    }
}

/// Marker set on an item once it has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMarker {
    pub at: DateTime<Utc>,
    pub actor: String,
}

/// A run not yet in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionItem {
    pub item_id: String,
    pub fingerprint: Fingerprint,
    pub record: ExperimentRecord,
    #[serde(default)]
    pub applied: Option<AppliedMarker>,
}

/// Field-level changes to a stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub item_id: String,
    pub run_id: String,
    /// `updated_at` of the stored record the diff was computed against.
    pub base_updated_at: DateTime<Utc>,
    pub base_fingerprint: Fingerprint,
    #[serde(default)]
    pub field_diffs: Vec<FieldChange>,
    #[serde(default)]
    pub new_paths: Vec<String>,
    #[serde(default)]
    pub applied: Option<AppliedMarker>,
}

/// Why two runs were paired for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeReason {
    /// Same flowcell, device, date and time under different run ids.
    SharedFingerprint,
    /// Same flowcell, start times within the adjacency window.
    AdjacentOnFlowcell,
}

impl MergeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SharedFingerprint => "shared-fingerprint",
            Self::AdjacentOnFlowcell => "adjacent-on-flowcell",
        }
    }
}

/// Where a merge-candidate side lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SideOrigin {
    Store,
    Candidate,
}

/// One side of a merge candidate, with everything needed to compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSide {
    pub origin: SideOrigin,
    pub record: ExperimentRecord,
}

/// Two runs suspected to be the same. Never resolved automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub item_id: String,
    pub fingerprint: Fingerprint,
    pub reason: MergeReason,
    pub run_id_a: String,
    pub run_id_b: String,
    pub side_a: MergeSide,
    pub side_b: MergeSide,
    /// Run id the ranking heuristic would keep as canonical. Advisory only.
    pub suggested_canonical: String,
    pub suggestion_reason: String,
    #[serde(default)]
    pub applied: Option<AppliedMarker>,
}

/// A batch of proposed registry changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub generated_at: DateTime<Utc>,
    pub source_scan_id: String,
    #[serde(default)]
    pub status: ProposalStatus,
    pub additions: Vec<AdditionItem>,
    pub updates: Vec<UpdateItem>,
    pub merge_candidates: Vec<MergeCandidate>,
    #[serde(default)]
    pub unidentifiable: Vec<UnidentifiableCandidate>,
    /// Candidates that matched a stored run exactly.
    #[serde(default)]
    pub unchanged: Vec<String>,
}

/// Kind of a proposal item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Addition,
    Update,
    Merge,
}

impl Proposal {
    /// True when nothing in the proposal needs review.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.merge_candidates.is_empty()
    }

    /// All item ids with their kind and applied state, in proposal order.
    pub fn items(&self) -> Vec<(ItemKind, &str, bool)> {
        let additions = self
            .additions
            .iter()
            .map(|a| (ItemKind::Addition, a.item_id.as_str(), a.applied.is_some()));
        let updates = self
            .updates
            .iter()
            .map(|u| (ItemKind::Update, u.item_id.as_str(), u.applied.is_some()));
        let merges = self
            .merge_candidates
            .iter()
            .map(|m| (ItemKind::Merge, m.item_id.as_str(), m.applied.is_some()));
        additions.chain(updates).chain(merges).collect()
    }

    pub fn contains_item(&self, item_id: &str) -> bool {
        self.items().iter().any(|(_, id, _)| *id == item_id)
    }

    /// Recompute `status` from the per-item markers.
    pub fn refresh_status(&mut self) {
        let items = self.items();
        let applied = items.iter().filter(|(_, _, done)| *done).count();
        self.status = if items.is_empty() || applied == items.len() {
            ProposalStatus::Applied
        } else if applied == 0 {
            ProposalStatus::Pending
        } else {
            ProposalStatus::PartiallyApplied
        };
    }

    /// Timestamped, content-addressed file name.
    pub fn file_name(&self) -> String {
        format!(
            "{PROPOSAL_PREFIX}{}_{}.json",
            self.generated_at.format("%Y%m%d_%H%M%S"),
            self.proposal_id
        )
    }

    /// Canonical JSON rendering. Identical proposals render byte-identically.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| RegistryError::InvalidProposal {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Write into `dir` under [`Proposal::file_name`]. Returns the path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        self.write(&path)?;
        Ok(path)
    }
}

/// Short content hash used as a proposal id.
pub(crate) fn content_id(value: &JsonValue) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(crate::identity::FINGERPRINT_LEN);
    id
}

/// `(name, path)` of files in `dir` starting with `prefix` and ending in
/// `.json`. A missing directory has none.
fn json_files(dir: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RegistryError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RegistryError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(".json") {
            files.push((name, entry.path()));
        }
    }
    Ok(files)
}

/// Greatest file name in `dir` starting with `prefix` and ending in `.json`.
pub(crate) fn latest_with_prefix(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    Ok(json_files(dir, prefix)?
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path))
}

/// Proposal file in `dir` already carrying `proposal_id`, oldest first.
pub fn find_proposal(dir: &Path, proposal_id: &str) -> Result<Option<PathBuf>> {
    let suffix = format!("_{proposal_id}.json");
    Ok(json_files(dir, PROPOSAL_PREFIX)?
        .into_iter()
        .filter(|(name, _)| name.ends_with(&suffix))
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path))
}

/// Most recent proposal file in `dir`.
pub fn latest_proposal(dir: &Path) -> Result<PathBuf> {
    latest_with_prefix(dir, PROPOSAL_PREFIX)?
        .ok_or_else(|| RegistryError::ProposalNotFound(format!("no proposals in {}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn empty_proposal(generated_at: DateTime<Utc>, id: &str) -> Proposal {
        Proposal {
            proposal_id: id.to_string(),
            generated_at,
            source_scan_id: "scan_test".to_string(),
            status: ProposalStatus::Pending,
            additions: Vec::new(),
            updates: Vec::new(),
            merge_candidates: Vec::new(),
            unidentifiable: Vec::new(),
            unchanged: Vec::new(),
        }
    }

    fn addition(item_id: &str) -> AdditionItem {
        AdditionItem {
            item_id: item_id.to_string(),
            fingerprint: crate::identity::fingerprint_of(&Default::default(), item_id),
            record: ExperimentRecord::new(item_id, format!("/data/{item_id}")),
            applied: None,
        }
    }

    #[test]
    fn latest_picks_newest_timestamp() {
        let tmp = tempfile::TempDir::new().unwrap();
        let older = empty_proposal("2025-01-01T10:00:00Z".parse().unwrap(), "aaaa");
        let newer = empty_proposal("2025-02-01T10:00:00Z".parse().unwrap(), "0000");
        older.write_to_dir(tmp.path()).unwrap();
        let newer_path = newer.write_to_dir(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(latest_proposal(tmp.path()).unwrap(), newer_path);
    }

    #[test]
    fn latest_in_empty_dir_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = latest_proposal(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, RegistryError::ProposalNotFound(_)));
    }

    #[test]
    fn status_tracks_applied_markers() {
        let mut proposal = empty_proposal(Utc::now(), "p");
        proposal.additions = vec![addition("a"), addition("b")];
        proposal.refresh_status();
        assert_eq!(proposal.status, ProposalStatus::Pending);

        proposal.additions[0].applied = Some(AppliedMarker {
            at: Utc::now(),
            actor: "tester".to_string(),
        });
        proposal.refresh_status();
        assert_eq!(proposal.status, ProposalStatus::PartiallyApplied);

        proposal.additions[1].applied = proposal.additions[0].applied.clone();
        proposal.refresh_status();
        assert_eq!(proposal.status, ProposalStatus::Applied);
    }

    #[test]
    fn file_roundtrip_keeps_markers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut proposal = empty_proposal("2025-01-01T10:00:00Z".parse().unwrap(), "abcd");
        proposal.additions = vec![addition("a")];
        proposal.additions[0].applied = Some(AppliedMarker {
            at: "2025-01-02T00:00:00Z".parse().unwrap(),
            actor: "tester".to_string(),
        });
        let path = proposal.write_to_dir(tmp.path()).unwrap();
        assert!(path.ends_with("proposal_20250101_100000_abcd.json"));
        assert_eq!(Proposal::read(&path).unwrap(), proposal);
    }

    #[test]
    fn find_by_id_ignores_other_proposals() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = empty_proposal("2025-01-01T10:00:00Z".parse().unwrap(), "abcd");
        let other = empty_proposal("2025-01-02T10:00:00Z".parse().unwrap(), "ffff");
        let first_path = first.write_to_dir(tmp.path()).unwrap();
        other.write_to_dir(tmp.path()).unwrap();

        assert_eq!(find_proposal(tmp.path(), "abcd").unwrap(), Some(first_path));
        assert_eq!(find_proposal(tmp.path(), "0000").unwrap(), None);
        assert_eq!(find_proposal(&tmp.path().join("missing"), "abcd").unwrap(), None);
    }
}
