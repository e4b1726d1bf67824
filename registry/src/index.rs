//! Secondary indexes: flowcell, device and experiment name → run ids.
//!
//! Indexes are derived state. They are rebuilt from the records on every
//! load and only persisted as a convenience cache for downstream readers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::ExperimentRecord;

type KeyIndex = BTreeMap<String, Vec<String>>;

/// Lookup tables from secondary keys to sorted, deduplicated run ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexes {
    #[serde(default)]
    pub by_flowcell: KeyIndex,
    #[serde(default)]
    pub by_device: KeyIndex,
    #[serde(default)]
    pub by_experiment_name: KeyIndex,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn keys(record: &ExperimentRecord) -> [Option<&str>; 3] {
    [
        non_empty(&record.identity.flowcell),
        non_empty(&record.identity.device),
        non_empty(&record.experiment_name),
    ]
}

fn insert_into(index: &mut KeyIndex, key: &str, run_id: &str) {
    let ids = index.entry(key.to_string()).or_default();
    if let Err(pos) = ids.binary_search_by(|id| id.as_str().cmp(run_id)) {
        ids.insert(pos, run_id.to_string());
    }
}

fn remove_from(index: &mut KeyIndex, key: &str, run_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|id| id != run_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl Indexes {
    /// Rebuild all indexes from scratch in one pass.
    pub fn rebuild<'a>(records: impl IntoIterator<Item = &'a ExperimentRecord>) -> Self {
        let mut indexes = Self::default();
        for record in records {
            indexes.insert(record);
        }
        indexes
    }

    /// Add `record` under its keys. Inserting twice is a no-op.
    pub fn insert(&mut self, record: &ExperimentRecord) {
        let [flowcell, device, name] = keys(record);
        let run_id = record.run_id.as_str();
        if let Some(key) = flowcell {
            insert_into(&mut self.by_flowcell, key, run_id);
        }
        if let Some(key) = device {
            insert_into(&mut self.by_device, key, run_id);
        }
        if let Some(key) = name {
            insert_into(&mut self.by_experiment_name, key, run_id);
        }
    }

    /// Drop `record` from the entries its current keys point at.
    pub fn remove(&mut self, record: &ExperimentRecord) {
        let [flowcell, device, name] = keys(record);
        let run_id = record.run_id.as_str();
        if let Some(key) = flowcell {
            remove_from(&mut self.by_flowcell, key, run_id);
        }
        if let Some(key) = device {
            remove_from(&mut self.by_device, key, run_id);
        }
        if let Some(key) = name {
            remove_from(&mut self.by_experiment_name, key, run_id);
        }
    }

    pub fn runs_on_flowcell(&self, flowcell: &str) -> &[String] {
        self.by_flowcell.get(flowcell).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn runs_on_device(&self, device: &str) -> &[String] {
        self.by_device.get(device).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn runs_named(&self, name: &str) -> &[String] {
        self.by_experiment_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }
}
