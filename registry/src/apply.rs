//! Apply approved proposal items to the store.
//!
//! The store is re-loaded before anything is applied and every item is
//! checked against the state it was proposed for. Items whose base moved
//! fail with a stale-base reason instead of clobbering newer data; other
//! items in the batch still go through. Applied items are marked in the
//! proposal, and every applied item leaves an event tagged with the proposal
//! and item ids, so applying the same proposal again changes nothing even if
//! the marked proposal was never written back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{RegistryError, Result};
use crate::events::ActorContext;
use crate::identity::{dedup_key, fingerprint};
use crate::proposal::{
    AdditionItem, AppliedMarker, ItemKind, MergeCandidate, Proposal, UpdateItem,
};
use crate::record::FieldChange;
use crate::store::{Store, StorePaths};

/// Reason prefix for items whose base changed since the proposal.
pub const STALE_BASE: &str = "stale-base, retry";

/// Which items of a proposal the operator approved.
#[derive(Debug, Clone, Default)]
pub struct Approvals {
    pub all: bool,
    pub additions: bool,
    pub updates: bool,
    /// Explicit item ids.
    pub items: BTreeSet<String>,
    /// Decision notes by item id. A note also approves its item.
    pub notes: BTreeMap<String, String>,
}

impl Approvals {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn items<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_note(mut self, item_id: impl Into<String>, note: impl Into<String>) -> Self {
        self.notes.insert(item_id.into(), note.into());
        self
    }

    pub fn approves(&self, kind: ItemKind, item_id: &str) -> bool {
        self.all
            || (self.additions && kind == ItemKind::Addition)
            || (self.updates && kind == ItemKind::Update)
            || self.items.contains(item_id)
            || self.notes.contains_key(item_id)
    }

    pub fn note(&self, item_id: &str) -> Option<String> {
        self.notes.get(item_id).cloned()
    }

    fn named_ids(&self) -> impl Iterator<Item = &String> {
        self.items.iter().chain(self.notes.keys())
    }
}

/// Outcome of one proposal item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub reason: String,
}

/// Per-item report of an apply run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub applied: Vec<ItemOutcome>,
    pub skipped: Vec<ItemOutcome>,
    pub failed: Vec<ItemOutcome>,
}

impl ApplyResult {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

enum Step {
    Applied(String),
    Skipped(String),
    Failed(String),
}

impl ApplyResult {
    /// Record `step` for `item_id`; true when the item was applied.
    fn record(&mut self, item_id: &str, step: Step) -> bool {
        let outcome = |reason: String| ItemOutcome {
            item_id: item_id.to_string(),
            reason,
        };
        match step {
            Step::Applied(reason) => {
                self.applied.push(outcome(reason));
                true
            }
            Step::Skipped(reason) => {
                self.skipped.push(outcome(reason));
                false
            }
            Step::Failed(reason) => {
                tracing::warn!(item_id, %reason, "proposal item failed");
                self.failed.push(outcome(reason));
                false
            }
        }
    }
}

fn stale(detail: &str) -> Step {
    Step::Failed(format!("{STALE_BASE} ({detail})"))
}

fn apply_addition(store: &mut Store, item: &AdditionItem, ctx: &ActorContext) -> Result<Step> {
    let run_id = &item.record.run_id;
    if store.contains(run_id) {
        return Ok(stale("run registered since proposal"));
    }
    if let Some(key) = dedup_key(&item.record.identity)
        && let Some(other) = store.with_dedup_key(&key).first()
    {
        return Ok(stale(&format!("run {} now shares its identity", other.run_id)));
    }

    let outcome = store.upsert(item.record.clone(), ctx, false)?;
    Ok(if outcome.applied {
        Step::Applied(outcome.reason)
    } else {
        Step::Skipped(outcome.reason)
    })
}

fn apply_update(store: &mut Store, item: &UpdateItem, ctx: &ActorContext) -> Result<Step> {
    let Some(current) = store.get(&item.run_id) else {
        return Ok(stale("run no longer registered"));
    };
    if current.updated_at != item.base_updated_at {
        return Ok(stale("run changed since proposal"));
    }
    if fingerprint(current) != item.base_fingerprint {
        return Ok(stale("run identity changed since proposal"));
    }

    let mut revised = current.clone();
    for change in &item.field_diffs {
        if !revised.set_field(&change.field, &change.after) {
            return Ok(Step::Failed(format!(
                "cannot set field {} to {}",
                change.field, change.after
            )));
        }
    }
    for path in &item.new_paths {
        revised.add_path(path);
    }
    if let Some(key) = dedup_key(&revised.identity)
        && let Some(other) = store
            .with_dedup_key(&key)
            .into_iter()
            .find(|r| r.run_id != item.run_id)
    {
        return Ok(stale(&format!(
            "run {} already holds the revised identity",
            other.run_id
        )));
    }

    let outcome = store.update(revised, ctx)?;
    Ok(if outcome.applied {
        Step::Applied(outcome.reason)
    } else {
        Step::Skipped(outcome.reason)
    })
}

fn apply_merge(store: &mut Store, item: &MergeCandidate, ctx: &ActorContext) -> Result<Step> {
    if ctx.note.is_none() {
        return Ok(Step::Skipped(
            "merge candidates require a decision note".to_string(),
        ));
    }
    let pairing = FieldChange {
        field: "paired_run_id".to_string(),
        before: JsonValue::Null,
        after: JsonValue::from(item.run_id_b.clone()),
    };
    store.record_review(&item.run_id_a, ctx, vec![pairing])?;
    Ok(Step::Applied("decision recorded".to_string()))
}

/// Store errors fail only the item that hit them.
fn settle(step: Result<Step>) -> Step {
    step.unwrap_or_else(|err| Step::Failed(err.to_string()))
}

/// Run one item. If another writer saved the registry after this handle
/// loaded it, reload and check the item again against the newer state.
fn attempt<T>(
    store: &mut Store,
    item: &T,
    ctx: &ActorContext,
    apply_item: fn(&mut Store, &T, &ActorContext) -> Result<Step>,
) -> Step {
    match apply_item(store, item, ctx) {
        Err(RegistryError::RegistryChanged { .. }) => {
            tracing::info!("registry changed on disk, reloading");
            if let Err(err) = store.reload() {
                return Step::Failed(err.to_string());
            }
            match apply_item(store, item, ctx) {
                Err(RegistryError::RegistryChanged { .. }) => {
                    stale("registry kept changing during apply")
                }
                other => settle(other),
            }
        }
        other => settle(other),
    }
}

/// Items of `proposal_id` that already left an event, with who applied them.
fn recorded_items(store: &Store, proposal_id: &str) -> Result<BTreeMap<String, AppliedMarker>> {
    let mut recorded = BTreeMap::new();
    for event in store.events().read_all()? {
        if event.proposal_id.as_deref() == Some(proposal_id)
            && let Some(item_id) = event.item_id
        {
            recorded.entry(item_id).or_insert(AppliedMarker {
                at: event.timestamp,
                actor: event.actor,
            });
        }
    }
    Ok(recorded)
}

fn already_applied() -> Step {
    Step::Skipped("already applied".to_string())
}

fn marker(actor: &str) -> Option<AppliedMarker> {
    Some(AppliedMarker {
        at: Utc::now(),
        actor: actor.to_string(),
    })
}

/// Apply the approved items of `proposal` to the store at `paths`.
///
/// Fails as a whole only when the store cannot be loaded. Markers and status
/// are updated in `proposal`; persisting it is up to the caller (see
/// [`apply_file`]).
pub fn apply(
    paths: &StorePaths,
    proposal: &mut Proposal,
    approvals: &Approvals,
    ctx: &ActorContext,
) -> Result<ApplyResult> {
    let mut store = Store::load(paths.clone())?;
    let recorded = recorded_items(&store, &proposal.proposal_id)?;
    let mut result = ApplyResult::default();
    let proposal_id = proposal.proposal_id.clone();
    let item_ctx = |item_id: &str| {
        ctx.for_item(&proposal_id, item_id)
            .with_note(approvals.note(item_id))
    };

    let unknown: BTreeSet<&String> = approvals
        .named_ids()
        .filter(|id| !proposal.contains_item(id))
        .collect();
    for id in unknown {
        result.record(id, Step::Failed("no such item in proposal".to_string()));
    }

    for item in &mut proposal.additions {
        if !approvals.approves(ItemKind::Addition, &item.item_id) {
            continue;
        }
        let ctx = item_ctx(&item.item_id);
        if item.applied.is_none() {
            item.applied = recorded.get(&item.item_id).cloned();
        }
        let step = match &item.applied {
            Some(_) => already_applied(),
            None => attempt(&mut store, &*item, &ctx, apply_addition),
        };
        if result.record(&item.item_id, step) {
            item.applied = marker(&ctx.actor);
        }
    }

    for item in &mut proposal.updates {
        if !approvals.approves(ItemKind::Update, &item.item_id) {
            continue;
        }
        let ctx = item_ctx(&item.item_id);
        if item.applied.is_none() {
            item.applied = recorded.get(&item.item_id).cloned();
        }
        let step = match &item.applied {
            Some(_) => already_applied(),
            None => attempt(&mut store, &*item, &ctx, apply_update),
        };
        if result.record(&item.item_id, step) {
            item.applied = marker(&ctx.actor);
        }
    }

    for item in &mut proposal.merge_candidates {
        if !approvals.approves(ItemKind::Merge, &item.item_id) {
            continue;
        }
        let ctx = item_ctx(&item.item_id);
        if item.applied.is_none() {
            item.applied = recorded.get(&item.item_id).cloned();
        }
        let step = match &item.applied {
            Some(_) => already_applied(),
            None => attempt(&mut store, &*item, &ctx, apply_merge),
        };
        if result.record(&item.item_id, step) {
            item.applied = marker(&ctx.actor);
        }
    }

    proposal.refresh_status();
    tracing::info!(
        proposal_id = %proposal.proposal_id,
        applied = result.applied.len(),
        skipped = result.skipped.len(),
        failed = result.failed.len(),
        "applied proposal"
    );
    Ok(result)
}

/// Apply a proposal file and rewrite it with the new markers, even when some
/// items failed.
pub fn apply_file(
    paths: &StorePaths,
    proposal_path: &Path,
    approvals: &Approvals,
    ctx: &ActorContext,
) -> Result<(Proposal, ApplyResult)> {
    let mut proposal = Proposal::read(proposal_path)?;
    let result = apply(paths, &mut proposal, approvals, ctx)?;
    proposal.write(proposal_path)?;
    Ok((proposal, result))
}
