//! Reconciliation: diff a scanner batch against the store.
//!
//! Classification per candidate (after intake and same-run folding):
//!
//! | Store `run_id` | Dedup-key collision | Result |
//! |---|---|---|
//! | match | - | update (field diffs + new paths), or unchanged |
//! | no match | yes | merge candidate, never an addition |
//! | no match | no | addition (plus advisory adjacency pairing) |
//!
//! `reconcile` is a pure function of its inputs: the same store, batch and
//! options always serialize to byte-identical proposals.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use crate::candidates::{IdentifiedCandidate, RawCandidate, intake};
use crate::identity::{
    Fingerprint, RankKey, dedup_key, fingerprint, fingerprint_of, rank_order, started_at,
};
use crate::proposal::{
    AdditionItem, MergeCandidate, MergeReason, MergeSide, Proposal, ProposalStatus, SideOrigin,
    UpdateItem, content_id,
};
use crate::record::{ExperimentRecord, FieldChange};
use crate::store::Store;

/// Default window for pairing runs on the same flowcell.
pub const DEFAULT_ADJACENCY_WINDOW_MINUTES: i64 = 120;

/// Inputs besides the batch and the store.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub source_scan_id: String,
    pub generated_at: DateTime<Utc>,
    /// Maximum start-time gap for `adjacent-on-flowcell` pairs.
    pub adjacency_window: Duration,
}

impl ReconcileOptions {
    pub fn new(source_scan_id: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
        Self {
            source_scan_id: source_scan_id.into(),
            generated_at,
            adjacency_window: Duration::minutes(DEFAULT_ADJACENCY_WINDOW_MINUTES),
        }
    }

    pub fn with_adjacency_window(mut self, window: Duration) -> Self {
        self.adjacency_window = window;
        self
    }
}

/// All copies of one run found in a batch, folded into one record.
#[derive(Debug, Clone)]
struct Folded {
    record: ExperimentRecord,
    /// Scanner output of the best-ranked copy.
    raw: RawCandidate,
    discovery_index: usize,
}

fn fold(identified: Vec<IdentifiedCandidate>) -> Vec<Folded> {
    let mut groups: BTreeMap<String, Vec<IdentifiedCandidate>> = BTreeMap::new();
    for candidate in identified {
        groups
            .entry(candidate.run_id.clone())
            .or_default()
            .push(candidate);
    }

    let mut folded: Vec<Folded> = groups
        .into_values()
        .filter_map(|copies| {
            let records: Vec<ExperimentRecord> =
                copies.iter().map(IdentifiedCandidate::to_record).collect();
            let best = (0..copies.len()).min_by(|&a, &b| {
                let key = |i: usize| RankKey {
                    ranking: &records[i].ranking,
                    identity: &records[i].identity,
                    registered_at: None,
                    discovery_index: copies[i].discovery_index,
                };
                rank_order(&key(a), &key(b))
            })?;

            let mut record = records[best].clone();
            for copy in &records {
                record.add_path(&copy.canonical_path);
            }
            if copies.len() > 1 {
                tracing::debug!(
                    run_id = %record.run_id,
                    copies = copies.len(),
                    "folded duplicate copies of one run"
                );
            }
            Some(Folded {
                record,
                raw: copies[best].raw.clone(),
                discovery_index: copies.iter().map(|c| c.discovery_index).min().unwrap_or(0),
            })
        })
        .collect();
    folded.sort_by_key(|f| f.discovery_index);
    folded
}

/// Fields a candidate actually carries, as reviewable values.
fn carried_fields(raw: &RawCandidate, record: &ExperimentRecord) -> Vec<(&'static str, JsonValue)> {
    record
        .field_values()
        .into_iter()
        .filter(|(field, value)| match *field {
            "flowcell" | "device" | "date" | "time" | "experiment_name" | "harmonized_name"
            | "total_reads" | "total_bases" => !value.is_null(),
            "has_pod5" => raw.has_pod5.is_some(),
            "has_summary" => raw.has_summary.is_some(),
            _ => false,
        })
        .collect()
}

fn field_diffs(stored: &ExperimentRecord, folded: &Folded) -> Vec<FieldChange> {
    let before: BTreeMap<&str, JsonValue> = stored.field_values().into_iter().collect();
    carried_fields(&folded.raw, &folded.record)
        .into_iter()
        .filter_map(|(field, after)| {
            let before = before.get(field).cloned().unwrap_or(JsonValue::Null);
            (before != after).then(|| FieldChange {
                field: field.to_string(),
                before,
                after,
            })
        })
        .collect()
}

fn adjacent(a: &ExperimentRecord, b: &ExperimentRecord, window: Duration) -> bool {
    match (started_at(&a.identity), started_at(&b.identity)) {
        (Some(x), Some(y)) => (x - y).abs() <= window,
        _ => false,
    }
}

fn suggestion(a: &RankKey<'_>, b: &RankKey<'_>) -> &'static str {
    let reads = |k: &RankKey<'_>| k.ranking.total_reads.unwrap_or(0);
    if reads(a) != reads(b) {
        "most total_reads"
    } else if started_at(a.identity) != started_at(b.identity) {
        "most recent run start"
    } else if a.registered_at != b.registered_at {
        "registered first"
    } else {
        "discovered first"
    }
}

struct Side<'a> {
    origin: SideOrigin,
    record: &'a ExperimentRecord,
    discovery_index: usize,
}

impl Side<'_> {
    fn rank_key(&self) -> RankKey<'_> {
        RankKey {
            ranking: &self.record.ranking,
            identity: &self.record.identity,
            registered_at: match self.origin {
                SideOrigin::Store => Some(self.record.registered_at),
                SideOrigin::Candidate => None,
            },
            discovery_index: self.discovery_index,
        }
    }

    fn into_merge_side(self) -> MergeSide {
        MergeSide {
            origin: self.origin,
            record: self.record.clone(),
        }
    }
}

fn merge_candidate(reason: MergeReason, x: Side<'_>, y: Side<'_>) -> MergeCandidate {
    let (a, b) = if x.record.run_id <= y.record.run_id {
        (x, y)
    } else {
        (y, x)
    };
    let (ka, kb) = (a.rank_key(), b.rank_key());
    let suggested_canonical = match rank_order(&ka, &kb) {
        Ordering::Greater => b.record.run_id.clone(),
        Ordering::Less | Ordering::Equal => a.record.run_id.clone(),
    };
    let suggestion_reason = suggestion(&ka, &kb).to_string();
    let key = dedup_key(&a.record.identity)
        .unwrap_or_else(|| fingerprint_of(&a.record.identity, &a.record.run_id));

    MergeCandidate {
        item_id: format!("merge:{}+{}", a.record.run_id, b.record.run_id),
        fingerprint: key,
        reason,
        run_id_a: a.record.run_id.clone(),
        run_id_b: b.record.run_id.clone(),
        suggested_canonical,
        suggestion_reason,
        side_a: a.into_merge_side(),
        side_b: b.into_merge_side(),
        applied: None,
    }
}

/// Diff `candidates` against `store` and build a reviewable proposal.
pub fn reconcile(candidates: &[RawCandidate], store: &Store, options: &ReconcileOptions) -> Proposal {
    let intake = intake(candidates);
    let folded = fold(intake.identified);

    let mut additions = Vec::new();
    let mut updates = Vec::new();
    let mut merges: BTreeMap<(String, String), MergeCandidate> = BTreeMap::new();
    let mut unchanged = Vec::new();

    // New runs in this batch, grouped by physical identity and flowcell.
    let new_runs: Vec<&Folded> = folded
        .iter()
        .filter(|f| !store.contains(&f.record.run_id))
        .collect();
    let mut batch_by_key: BTreeMap<Fingerprint, Vec<&Folded>> = BTreeMap::new();
    for f in &new_runs {
        if let Some(key) = dedup_key(&f.record.identity) {
            batch_by_key.entry(key).or_default().push(f);
        }
    }

    let mut push_merge = |candidate: MergeCandidate| {
        let pair = (candidate.run_id_a.clone(), candidate.run_id_b.clone());
        merges.entry(pair).or_insert(candidate);
    };

    for f in &folded {
        let run_id = &f.record.run_id;

        if let Some(stored) = store.get(run_id) {
            let field_diffs = field_diffs(stored, f);
            let new_paths: Vec<String> = f
                .record
                .all_paths
                .iter()
                .filter(|p| !stored.all_paths.contains(p))
                .cloned()
                .collect();
            if field_diffs.is_empty() && new_paths.is_empty() {
                unchanged.push(run_id.clone());
                continue;
            }
            tracing::debug!(%run_id, fields = field_diffs.len(), paths = new_paths.len(), "update");
            updates.push(UpdateItem {
                item_id: format!("update:{run_id}"),
                run_id: run_id.clone(),
                base_updated_at: stored.updated_at,
                base_fingerprint: fingerprint(stored),
                field_diffs,
                new_paths,
                applied: None,
            });
            continue;
        }

        let candidate_side = || Side {
            origin: SideOrigin::Candidate,
            record: &f.record,
            discovery_index: f.discovery_index,
        };

        let mut collided = false;
        if let Some(key) = dedup_key(&f.record.identity) {
            for stored in store.with_dedup_key(&key) {
                collided = true;
                push_merge(merge_candidate(
                    MergeReason::SharedFingerprint,
                    candidate_side(),
                    Side {
                        origin: SideOrigin::Store,
                        record: stored,
                        discovery_index: usize::MAX,
                    },
                ));
            }
            for other in batch_by_key.get(&key).into_iter().flatten() {
                if other.record.run_id == *run_id {
                    continue;
                }
                collided = true;
                push_merge(merge_candidate(
                    MergeReason::SharedFingerprint,
                    candidate_side(),
                    Side {
                        origin: SideOrigin::Candidate,
                        record: &other.record,
                        discovery_index: other.discovery_index,
                    },
                ));
            }
        }
        if collided {
            tracing::warn!(%run_id, "fingerprint collision, proposing merge review");
            continue;
        }

        if let Some(flowcell) = f.record.identity.flowcell.as_deref() {
            let stored_neighbours = store
                .indexes()
                .runs_on_flowcell(flowcell)
                .iter()
                .filter_map(|id| store.get(id))
                .filter(|s| adjacent(s, &f.record, options.adjacency_window));
            for stored in stored_neighbours {
                push_merge(merge_candidate(
                    MergeReason::AdjacentOnFlowcell,
                    candidate_side(),
                    Side {
                        origin: SideOrigin::Store,
                        record: stored,
                        discovery_index: usize::MAX,
                    },
                ));
            }
            let batch_neighbours = new_runs.iter().filter(|o| {
                o.record.run_id != *run_id
                    && o.record.identity.flowcell.as_deref() == Some(flowcell)
                    && dedup_key(&o.record.identity) != dedup_key(&f.record.identity)
                    && adjacent(&o.record, &f.record, options.adjacency_window)
            });
            for other in batch_neighbours {
                push_merge(merge_candidate(
                    MergeReason::AdjacentOnFlowcell,
                    candidate_side(),
                    Side {
                        origin: SideOrigin::Candidate,
                        record: &other.record,
                        discovery_index: other.discovery_index,
                    },
                ));
            }
        }

        additions.push(AdditionItem {
            item_id: format!("add:{run_id}"),
            fingerprint: fingerprint(&f.record),
            record: f.record.clone(),
            applied: None,
        });
    }

    additions.sort_by_key(|item| {
        (
            started_at(&item.record.identity),
            item.record.identity.date.clone(),
            item.record.identity.time.clone(),
            item.record.run_id.clone(),
        )
    });
    updates.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    let mut merge_candidates: Vec<MergeCandidate> = merges.into_values().collect();
    merge_candidates.sort_by(|a, b| {
        (&a.fingerprint, &a.run_id_a, &a.run_id_b).cmp(&(&b.fingerprint, &b.run_id_a, &b.run_id_b))
    });
    let mut unidentifiable = intake.unidentifiable;
    unidentifiable.sort();
    unchanged.sort();

    let proposal_id = content_id(&serde_json::json!({
        "source_scan_id": options.source_scan_id,
        "additions": additions,
        "updates": updates,
        "merge_candidates": merge_candidates,
        "unidentifiable": unidentifiable,
        "unchanged": unchanged,
    }));

    tracing::info!(
        %proposal_id,
        additions = additions.len(),
        updates = updates.len(),
        merge_candidates = merge_candidates.len(),
        unidentifiable = unidentifiable.len(),
        unchanged = unchanged.len(),
        "reconciled candidate batch"
    );

    Proposal {
        proposal_id,
        generated_at: options.generated_at,
        source_scan_id: options.source_scan_id.clone(),
        status: ProposalStatus::Pending,
        additions,
        updates,
        merge_candidates,
        unidentifiable,
        unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActorContext;
    use crate::store::StorePaths;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawCandidate {
        serde_json::from_value(value).unwrap()
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions::new("scan_20250101_120000", "2025-01-01T12:00:00Z".parse().unwrap())
    }

    fn open(dir: &std::path::Path) -> Store {
        Store::load(StorePaths::new(dir.join("registry.json"))).unwrap()
    }

    fn run(run_id: &str, path: &str, reads: u64) -> JsonValue {
        json!({
            "canonical_path": path,
            "run_id": run_id,
            "flowcell": "FAW12345",
            "device": "MN1",
            "date": "2025-01-01",
            "time": "10:00",
            "total_reads": reads
        })
    }

    fn seed(store: &mut Store, value: JsonValue) {
        let batch = [raw(value)];
        let identified = intake(&batch).identified;
        store
            .upsert(identified[0].to_record(), &ActorContext::new("seed"), false)
            .unwrap();
    }

    #[test]
    fn new_run_becomes_addition() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path());

        let proposal = reconcile(&[raw(run("r1", "/data/r1", 10))], &store, &options());
        assert_eq!(proposal.additions.len(), 1);
        assert_eq!(proposal.additions[0].item_id, "add:r1");
        assert_eq!(proposal.additions[0].record.all_paths, vec!["/data/r1"]);
        assert!(proposal.updates.is_empty());
        assert!(proposal.merge_candidates.is_empty());
        assert_eq!(proposal.status, ProposalStatus::Pending);
    }

    #[test]
    fn reconcile_is_byte_identical_across_runs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut store = open(tmp.path());
        seed(&mut store, run("stored", "/data/stored", 1));

        let batch = vec![
            raw(run("r2", "/data/r2", 20)),
            raw(json!({"canonical_path": "/data/unknown"})),
            raw(run("stored", "/data/stored_copy", 1)),
            raw(json!({"canonical_path": "/data/r3", "run_id": "r3", "date": "2024-12-31"})),
        ];
        let first = reconcile(&batch, &store, &options()).to_json().unwrap();
        let second = reconcile(&batch, &store, &options()).to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shared_identity_yields_merge_with_suggestion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut store = open(tmp.path());
        seed(&mut store, run("A", "/data/a", 1000));

        let proposal = reconcile(&[raw(run("B", "/data/b", 5000))], &store, &options());
        assert!(proposal.additions.is_empty());
        assert!(proposal.updates.is_empty());
        assert_eq!(proposal.merge_candidates.len(), 1);

        let merge = &proposal.merge_candidates[0];
        assert_eq!(merge.reason, MergeReason::SharedFingerprint);
        assert_eq!((merge.run_id_a.as_str(), merge.run_id_b.as_str()), ("A", "B"));
        assert_eq!(merge.side_a.origin, SideOrigin::Store);
        assert_eq!(merge.side_b.origin, SideOrigin::Candidate);
        assert_eq!(merge.suggested_canonical, "B");
        assert_eq!(merge.suggestion_reason, "most total_reads");
        assert_eq!(merge.item_id, "merge:A+B");
    }

    #[test]
    fn shared_identity_within_batch_is_not_added() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path());

        let batch = vec![raw(run("x", "/data/x", 7)), raw(run("y", "/data/y", 7))];
        let proposal = reconcile(&batch, &store, &options());
        assert!(proposal.additions.is_empty());
        assert_eq!(proposal.merge_candidates.len(), 1);
        // Equal reads and start: first discovered wins.
        assert_eq!(proposal.merge_candidates[0].suggested_canonical, "x");
        assert_eq!(proposal.merge_candidates[0].suggestion_reason, "discovered first");
    }

    #[test]
    fn same_run_twice_in_batch_folds_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path());

        let batch = vec![raw(run("r1", "/data/partial", 10)), raw(run("r1", "/data/full", 900))];
        let proposal = reconcile(&batch, &store, &options());
        assert_eq!(proposal.additions.len(), 1);
        let record = &proposal.additions[0].record;
        assert_eq!(record.canonical_path, "/data/full");
        assert_eq!(record.ranking.total_reads, Some(900));
        assert_eq!(record.all_paths, vec!["/data/full", "/data/partial"]);
    }

    #[test]
    fn rediscovery_at_new_path_is_an_update() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut store = open(tmp.path());
        seed(&mut store, run("r1", "/data/run1", 10));

        let proposal = reconcile(&[raw(run("r1", "/data/run1", 10))], &store, &options());
        assert!(proposal.is_empty());
        assert_eq!(proposal.unchanged, vec!["r1"]);

        let proposal = reconcile(&[raw(run("r1", "/backup/run1", 10))], &store, &options());
        assert_eq!(proposal.updates.len(), 1);
        let update = &proposal.updates[0];
        assert_eq!(update.item_id, "update:r1");
        assert_eq!(update.new_paths, vec!["/backup/run1"]);
        assert!(update.field_diffs.is_empty());
        assert_eq!(update.base_updated_at, store.get("r1").unwrap().updated_at);
    }

    #[test]
    fn update_diffs_only_carried_fields() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut store = open(tmp.path());
        seed(&mut store, run("r1", "/data/run1", 10));

        let candidate = raw(json!({
            "canonical_path": "/data/run1",
            "run_id": "r1",
            "total_reads": 2000,
            "harmonized_name": "pilot",
            "has_pod5": true
        }));
        let proposal = reconcile(&[candidate], &store, &options());
        let fields: Vec<&str> = proposal.updates[0]
            .field_diffs
            .iter()
            .map(|c| c.field.as_str())
            .collect();
        assert_eq!(fields, vec!["harmonized_name", "total_reads", "has_pod5"]);
        assert_eq!(proposal.updates[0].field_diffs[1].before, json!(10));
        assert_eq!(proposal.updates[0].field_diffs[1].after, json!(2000));
    }

    #[test]
    fn nearby_run_on_same_flowcell_is_flagged_but_added() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut store = open(tmp.path());
        seed(&mut store, run("early", "/data/early", 10));

        let mut later = run("later", "/data/later", 10);
        later["time"] = json!("10:45");
        let proposal = reconcile(&[raw(later.clone())], &store, &options());
        assert_eq!(proposal.additions.len(), 1);
        assert_eq!(proposal.merge_candidates.len(), 1);
        assert_eq!(proposal.merge_candidates[0].reason, MergeReason::AdjacentOnFlowcell);

        let narrow = options().with_adjacency_window(Duration::minutes(30));
        let proposal = reconcile(&[raw(later)], &store, &narrow);
        assert_eq!(proposal.additions.len(), 1);
        assert!(proposal.merge_candidates.is_empty());
    }

    #[test]
    fn additions_sorted_by_start_and_unidentifiable_listed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path());

        let batch = vec![
            raw(json!({"canonical_path": "/data/b", "run_id": "b", "date": "2025-03-01"})),
            raw(json!({"canonical_path": "/data/nothing"})),
            raw(json!({"canonical_path": "/data/a", "run_id": "a", "date": "2025-02-01"})),
        ];
        let proposal = reconcile(&batch, &store, &options());
        let ids: Vec<&str> = proposal.additions.iter().map(|a| a.item_id.as_str()).collect();
        assert_eq!(ids, vec!["add:a", "add:b"]);
        assert_eq!(proposal.unidentifiable.len(), 1);
        assert_eq!(proposal.unidentifiable[0].canonical_path, "/data/nothing");
        assert_eq!(proposal.unidentifiable[0].discovery_index, 1);
    }
}
