//! Durable experiment store.
//!
//! ## File Layout
//!
//! ```text
//! <registry>.json           { version, updated, stats, indexes, experiments }
//! <registry>.events.jsonl   one Event per line, append-only
//! ```
//!
//! The store is the single source of truth. `stats` and `indexes` in the
//! registry file are written for downstream readers but recomputed on load.
//! Every mutation persists immediately: the registry is swapped in with an
//! atomic rename, then the event is appended. If persisting fails the
//! in-memory state is rolled back to the previous record.
//!
//! A handle only writes over the registry it loaded. If another process saved
//! in between, the mutation fails with [`RegistryError::RegistryChanged`] and
//! the caller reloads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{RegistryError, Result};
use crate::events::{ActorContext, Event, EventAction, EventLog, default_log_path};
use crate::identity::{Fingerprint, dedup_key};
use crate::index::Indexes;
use crate::io::{read_optional, write_json_atomic};
use crate::record::{ExperimentRecord, FieldChange, diff_records};

/// Registry file format version written by this crate.
pub const REGISTRY_VERSION: &str = "1";

/// Locations of the registry file and its event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub registry: PathBuf,
    pub events: PathBuf,
}

impl StorePaths {
    /// Registry at `registry`, event log next to it.
    pub fn new(registry: impl Into<PathBuf>) -> Self {
        let registry = registry.into();
        let events = default_log_path(&registry);
        Self { registry, events }
    }

    pub fn with_events(mut self, events: impl Into<PathBuf>) -> Self {
        self.events = events.into();
        self
    }
}

/// Summary written into the registry file and shown by `stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_experiments: usize,
    pub total_paths: usize,
    pub total_reads: u64,
    pub total_bases: u64,
    pub with_pod5: usize,
    pub with_summary: usize,
    pub canonical: usize,
    pub flowcells: usize,
    pub devices: usize,
    pub runs_by_device: BTreeMap<String, usize>,
}

impl StoreStats {
    fn compute(experiments: &BTreeMap<String, ExperimentRecord>, indexes: &Indexes) -> Self {
        let mut stats = StoreStats {
            total_experiments: experiments.len(),
            flowcells: indexes.by_flowcell.len(),
            devices: indexes.by_device.len(),
            runs_by_device: indexes
                .by_device
                .iter()
                .map(|(device, runs)| (device.clone(), runs.len()))
                .collect(),
            ..Default::default()
        };
        for record in experiments.values() {
            stats.total_paths += record.all_paths.len();
            stats.total_reads += record.ranking.total_reads.unwrap_or(0);
            stats.total_bases += record.ranking.total_bases.unwrap_or(0);
            stats.with_pod5 += usize::from(record.ranking.has_pod5);
            stats.with_summary += usize::from(record.ranking.has_summary);
            stats.canonical += usize::from(record.ranking.is_canonical);
        }
        stats
    }
}

/// Result of [`Store::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub applied: bool,
    pub reason: String,
    pub action: Option<EventAction>,
}

impl UpsertOutcome {
    fn applied(action: EventAction, reason: &str) -> Self {
        Self {
            applied: true,
            reason: reason.to_string(),
            action: Some(action),
        }
    }

    fn unchanged(reason: &str) -> Self {
        Self {
            applied: false,
            reason: reason.to_string(),
            action: None,
        }
    }
}

/// Filter for [`Store::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub flowcell: Option<String>,
    pub device: Option<String>,
    pub experiment_name: Option<String>,
}

#[derive(Serialize)]
struct RegistryFileOut<'a> {
    version: &'static str,
    updated: Option<DateTime<Utc>>,
    stats: StoreStats,
    indexes: &'a Indexes,
    experiments: &'a BTreeMap<String, ExperimentRecord>,
}

#[derive(Deserialize)]
struct RegistryFileIn {
    version: JsonValue,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    experiments: BTreeMap<String, ExperimentRecord>,
}

/// Just the save stamp, to detect writes by other handles.
#[derive(Deserialize)]
struct RegistryStamp {
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

/// In-memory view of the registry, bound to its files.
#[derive(Debug)]
pub struct Store {
    paths: StorePaths,
    updated: Option<DateTime<Utc>>,
    experiments: BTreeMap<String, ExperimentRecord>,
    indexes: Indexes,
    by_dedup_key: BTreeMap<Fingerprint, Vec<String>>,
    events: EventLog,
}

impl Store {
    /// Load the registry at `paths`. A missing registry is an empty store.
    pub fn load(paths: StorePaths) -> Result<Self> {
        let events = EventLog::new(&paths.events);
        let mut store = Self {
            paths,
            updated: None,
            experiments: BTreeMap::new(),
            indexes: Indexes::default(),
            by_dedup_key: BTreeMap::new(),
            events,
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-read both files from disk, discarding in-memory state.
    pub fn reload(&mut self) -> Result<()> {
        // Validate the audit trail as well: a store whose log is corrupt must
        // not be mutated further.
        let event_count = self.events.read_all()?.len();

        let (updated, experiments) = match read_optional(&self.paths.registry)? {
            Some(content) => parse_registry(&self.paths.registry, &content)?,
            None => (None, BTreeMap::new()),
        };

        self.updated = updated;
        self.indexes = Indexes::rebuild(experiments.values());
        self.by_dedup_key = BTreeMap::new();
        for record in experiments.values() {
            if let Some(key) = dedup_key(&record.identity) {
                self.by_dedup_key
                    .entry(key)
                    .or_default()
                    .push(record.run_id.clone());
            }
        }
        self.experiments = experiments;

        tracing::debug!(
            registry = %self.paths.registry.display(),
            experiments = self.experiments.len(),
            events = event_count,
            "loaded store"
        );
        Ok(())
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn registry_path(&self) -> &Path {
        &self.paths.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Timestamp of the last successful save.
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.updated
    }

    pub fn get(&self, run_id: &str) -> Option<&ExperimentRecord> {
        self.experiments.get(run_id)
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.experiments.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Records ordered by run id.
    pub fn records(&self) -> impl Iterator<Item = &ExperimentRecord> {
        self.experiments.values()
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats::compute(&self.experiments, &self.indexes)
    }

    /// Stored records sharing the physical identity key `key`.
    pub fn with_dedup_key(&self, key: &Fingerprint) -> Vec<&ExperimentRecord> {
        self.by_dedup_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.experiments.get(id))
            .collect()
    }

    /// Records matching every populated field of `filter`, by run id.
    pub fn query(&self, filter: &RecordFilter) -> Vec<&ExperimentRecord> {
        let lookups = [
            filter
                .flowcell
                .as_deref()
                .map(|k| self.indexes.runs_on_flowcell(k)),
            filter
                .device
                .as_deref()
                .map(|k| self.indexes.runs_on_device(k)),
            filter
                .experiment_name
                .as_deref()
                .map(|k| self.indexes.runs_named(k)),
        ];
        self.experiments
            .values()
            .filter(|record| {
                lookups
                    .iter()
                    .flatten()
                    .all(|ids| ids.binary_search(&record.run_id).is_ok())
            })
            .collect()
    }

    /// Write the registry file without any mutation (e.g. to refresh caches).
    /// Fails with [`RegistryError::RegistryChanged`] if another writer saved
    /// since this handle loaded.
    pub fn save(&mut self) -> Result<()> {
        self.ensure_current()?;
        self.write()
    }

    fn write(&mut self) -> Result<()> {
        let updated = Utc::now();
        let file = RegistryFileOut {
            version: REGISTRY_VERSION,
            updated: Some(updated),
            stats: self.stats(),
            indexes: &self.indexes,
            experiments: &self.experiments,
        };
        write_json_atomic(&self.paths.registry, &file)?;
        self.updated = Some(updated);
        Ok(())
    }

    /// Insert a new run, or reconcile an incoming copy of a known one.
    ///
    /// - unknown `run_id`: inserted and stamped.
    /// - known, `force == false`: stored fields are kept, only new paths are
    ///   appended to `all_paths`.
    /// - known, `force == true`: the stored record is replaced (keeping
    ///   `registered_at`) and a `forced-update` event records the diff.
    pub fn upsert(
        &mut self,
        mut record: ExperimentRecord,
        ctx: &ActorContext,
        force: bool,
    ) -> Result<UpsertOutcome> {
        if record.run_id.trim().is_empty() {
            return Ok(UpsertOutcome::unchanged("record has no run_id"));
        }
        record.normalize_paths();
        let now = Utc::now();

        let Some(existing) = self.experiments.get(&record.run_id).cloned() else {
            record.registered_at = now;
            record.updated_at = now;
            let blank = ExperimentRecord::new(record.run_id.clone(), String::new());
            let changes = diff_records(&blank, &record);
            let event = Event::new(ctx, EventAction::Created, &record.run_id, changes, now);
            self.commit(None, record, event)?;
            return Ok(UpsertOutcome::applied(
                EventAction::Created,
                "registered new run",
            ));
        };

        if !force {
            let mut merged = existing.clone();
            let incoming = std::iter::once(&record.canonical_path).chain(&record.all_paths);
            let mut added = false;
            for path in incoming {
                added |= merged.add_path(path);
            }
            if !added {
                return Ok(UpsertOutcome::unchanged(
                    "run already registered with identical paths",
                ));
            }
            merged.updated_at = now;
            let changes = vec![FieldChange {
                field: "all_paths".to_string(),
                before: JsonValue::from(existing.all_paths.clone()),
                after: JsonValue::from(merged.all_paths.clone()),
            }];
            let event = Event::new(ctx, EventAction::PathAdded, &merged.run_id, changes, now);
            self.commit(Some(existing), merged, event)?;
            return Ok(UpsertOutcome::applied(
                EventAction::PathAdded,
                "updated paths for existing run",
            ));
        }

        self.replace(existing, record, ctx, EventAction::ForcedUpdate)
    }

    /// Replace a stored run with a reviewed revision of it.
    ///
    /// Same as a forced upsert, but recorded as `updated`: the caller has
    /// already checked the revision against the stored base.
    pub fn update(
        &mut self,
        mut record: ExperimentRecord,
        ctx: &ActorContext,
    ) -> Result<UpsertOutcome> {
        let Some(existing) = self.experiments.get(&record.run_id).cloned() else {
            return Ok(UpsertOutcome::unchanged("run not registered"));
        };
        record.normalize_paths();
        self.replace(existing, record, ctx, EventAction::Updated)
    }

    fn replace(
        &mut self,
        existing: ExperimentRecord,
        mut record: ExperimentRecord,
        ctx: &ActorContext,
        action: EventAction,
    ) -> Result<UpsertOutcome> {
        record.registered_at = existing.registered_at;
        record.updated_at = existing.updated_at;
        let changes = diff_records(&existing, &record);
        if changes.is_empty() && record.extra == existing.extra {
            return Ok(UpsertOutcome::unchanged("update carries no changes"));
        }
        let now = Utc::now();
        record.updated_at = now;
        let event = Event::new(ctx, action, &record.run_id, changes, now);
        self.commit(Some(existing), record, event)?;
        Ok(UpsertOutcome::applied(action, "replaced stored record"))
    }

    /// Record an operator decision about `run_id` without changing any record.
    pub fn record_review(
        &mut self,
        run_id: &str,
        ctx: &ActorContext,
        changes: Vec<FieldChange>,
    ) -> Result<()> {
        let event = Event::new(ctx, EventAction::MergeReviewed, run_id, changes, Utc::now());
        self.events.append(vec![event])?;
        tracing::info!(run_id, actor = %ctx.actor, "recorded merge review");
        Ok(())
    }

    fn install(&mut self, previous: Option<&ExperimentRecord>, record: ExperimentRecord) {
        if let Some(old) = previous {
            self.detach(old);
        }
        self.indexes.insert(&record);
        if let Some(key) = dedup_key(&record.identity) {
            let ids = self.by_dedup_key.entry(key).or_default();
            if !ids.contains(&record.run_id) {
                ids.push(record.run_id.clone());
            }
        }
        self.experiments.insert(record.run_id.clone(), record);
    }

    fn detach(&mut self, record: &ExperimentRecord) {
        self.indexes.remove(record);
        if let Some(key) = dedup_key(&record.identity)
            && let Some(ids) = self.by_dedup_key.get_mut(&key)
        {
            ids.retain(|id| id != &record.run_id);
            if ids.is_empty() {
                self.by_dedup_key.remove(&key);
            }
        }
        self.experiments.remove(&record.run_id);
    }

    /// Fail if the registry on disk is no longer the one this handle loaded.
    fn ensure_current(&self) -> Result<()> {
        let on_disk = match read_optional(&self.paths.registry)? {
            Some(content) => serde_json::from_str::<RegistryStamp>(&content)
                .map_err(|e| RegistryError::malformed(&self.paths.registry, e.to_string()))?
                .updated,
            None => None,
        };
        if on_disk != self.updated {
            return Err(RegistryError::RegistryChanged {
                path: self.paths.registry.clone(),
            });
        }
        Ok(())
    }

    /// Swap `record` in, persist registry + event, roll back on failure.
    fn commit(
        &mut self,
        previous: Option<ExperimentRecord>,
        record: ExperimentRecord,
        event: Event,
    ) -> Result<()> {
        self.ensure_current()?;
        let run_id = record.run_id.clone();
        let action = event.action;
        self.install(previous.as_ref(), record);

        if let Err(err) = self.write() {
            self.restore(&run_id, previous);
            tracing::warn!(%run_id, error = %err, "store mutation rolled back");
            return Err(err);
        }
        if let Err(err) = self.events.append(vec![event]) {
            self.restore(&run_id, previous);
            if let Err(resave) = self.write() {
                tracing::error!(%run_id, error = %resave, "registry left without its event");
            }
            tracing::warn!(%run_id, error = %err, "store mutation rolled back");
            return Err(err);
        }

        tracing::info!(%run_id, action = action.as_str(), "store updated");
        Ok(())
    }

    fn restore(&mut self, run_id: &str, previous: Option<ExperimentRecord>) {
        if let Some(new) = self.experiments.get(run_id).cloned() {
            self.detach(&new);
        }
        if let Some(old) = previous {
            self.install(None, old);
        }
    }
}

fn parse_registry(
    path: &Path,
    content: &str,
) -> Result<(Option<DateTime<Utc>>, BTreeMap<String, ExperimentRecord>)> {
    let file: RegistryFileIn = serde_json::from_str(content)
        .map_err(|e| RegistryError::malformed(path, e.to_string()))?;

    let version = match &file.version {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    if version != REGISTRY_VERSION {
        return Err(RegistryError::UnsupportedVersion {
            path: path.to_path_buf(),
            expected: REGISTRY_VERSION.to_string(),
            found: version,
        });
    }

    for (key, record) in &file.experiments {
        if key != &record.run_id {
            return Err(RegistryError::malformed(
                path,
                format!("experiment key {key} does not match run_id {}", record.run_id),
            ));
        }
        if let Some(dup) = record.duplicate_path() {
            return Err(RegistryError::malformed(
                path,
                format!("run {key} lists path {dup} more than once"),
            ));
        }
    }

    Ok((file.updated, file.experiments))
}
