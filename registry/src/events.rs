//! Append-only audit trail of store mutations.
//!
//! The log is a JSON-lines file next to the registry. Appends rewrite the file
//! through [`crate::io::atomic_write`], so a crash never leaves a torn line.
//! Events are never edited or removed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::io::{atomic_write, read_optional};
use crate::record::FieldChange;

/// Kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    Created,
    Updated,
    PathAdded,
    ForcedUpdate,
    /// Operator recorded a decision on a merge candidate. Nothing is merged.
    MergeReviewed,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::PathAdded => "path-added",
            Self::ForcedUpdate => "forced-update",
            Self::MergeReviewed => "merge-reviewed",
        }
    }
}

/// Who is mutating the store, and on behalf of which proposal item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorContext {
    pub actor: String,
    pub proposal_id: Option<String>,
    pub item_id: Option<String>,
    pub note: Option<String>,
}

impl ActorContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Default::default()
        }
    }

    /// Same actor, scoped to one proposal item.
    pub fn for_item(&self, proposal_id: &str, item_id: &str) -> Self {
        Self {
            actor: self.actor.clone(),
            proposal_id: Some(proposal_id.to_string()),
            item_id: Some(item_id.to_string()),
            note: None,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log, starting at 1. Assigned on append.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: EventAction,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Event {
    pub fn new(
        ctx: &ActorContext,
        action: EventAction,
        run_id: &str,
        changes: Vec<FieldChange>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            timestamp,
            actor: ctx.actor.clone(),
            action,
            run_id: run_id.to_string(),
            changes,
            proposal_id: ctx.proposal_id.clone(),
            item_id: ctx.item_id.clone(),
            note: ctx.note.clone(),
        }
    }
}

/// Default log location for a registry file: `<stem>.events.jsonl`.
pub fn default_log_path(registry_path: &Path) -> PathBuf {
    let stem = registry_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "registry".to_string());
    registry_path.with_file_name(format!("{stem}.events.jsonl"))
}

/// Handle on the JSON-lines event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Result<Vec<Event>> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<Event>(line).map_err(|e| {
                    RegistryError::malformed(&self.path, format!("line {}: {e}", i + 1))
                })
            })
            .collect()
    }

    /// All events in append order. A missing log is empty; a malformed line
    /// fails the whole read.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        match read_optional(&self.path)? {
            Some(content) => self.parse(&content),
            None => Ok(Vec::new()),
        }
    }

    /// Events touching `run_id`, in append order.
    pub fn for_run(&self, run_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect())
    }

    /// Append `events`, assigning sequence numbers. Returns them as written.
    pub fn append(&self, mut events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(events);
        }

        let mut content = read_optional(&self.path)?.unwrap_or_default();
        let existing = self.parse(&content)?;
        let mut seq = existing.last().map_or(0, |e| e.seq);

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for event in &mut events {
            seq += 1;
            event.seq = seq;
            content.push_str(&serde_json::to_string(event)?);
            content.push('\n');
        }

        atomic_write(&self.path, content.as_bytes())?;
        tracing::debug!(
            path = %self.path.display(),
            appended = events.len(),
            last_seq = seq,
            "appended events"
        );
        Ok(events)
    }
}
