//! `compare`, `review` and `apply`: the proposal cycle.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use nanoreg_registry::apply::apply_file;
use nanoreg_registry::candidates::latest_candidate_file;
use nanoreg_registry::proposal::{find_proposal, latest_proposal};
use nanoreg_registry::{
    ActorContext, ApplyResult, Approvals, CandidateBatch, Proposal, ReconcileOptions,
    RegistryConfig, reconcile,
};
use serde::Serialize;

use crate::render::{
    SavedProposal, print_json, print_lines, render_apply, render_compare_summary,
    render_proposal,
};
use crate::{EXIT_APPLY_FAILED, EXIT_OK, open_store};

#[derive(Debug, Parser)]
pub struct CompareArgs {
    /// Candidate file (default: newest in the candidates directory).
    pub candidates: Option<PathBuf>,

    /// Print the result without writing a proposal file.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Print the full proposal as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ReviewArgs {
    /// Proposal file.
    #[arg(conflicts_with = "latest")]
    pub proposal: Option<PathBuf>,

    /// Review the newest proposal (the default when no file is given).
    #[arg(long = "latest")]
    pub latest: bool,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ApplyArgs {
    /// Item ids to approve, e.g. `add:<run_id>` or `update:<run_id>`.
    pub items: Vec<String>,

    /// Proposal file.
    #[arg(long = "proposal", conflicts_with = "latest")]
    pub proposal: Option<PathBuf>,

    /// Apply the newest proposal (the default when no file is given).
    #[arg(long = "latest")]
    pub latest: bool,

    /// Approve every item.
    #[arg(long = "all")]
    pub all: bool,

    /// Approve all additions.
    #[arg(long = "additions")]
    pub additions: bool,

    /// Approve all updates.
    #[arg(long = "updates")]
    pub updates: bool,

    /// Decision note for an item, as ITEM_ID=TEXT. Required for merge candidates.
    #[arg(long = "note", value_name = "ITEM_ID=TEXT", value_parser = parse_note)]
    pub notes: Vec<(String, String)>,

    /// Actor recorded in events (default: `actor` from config).
    #[arg(long = "actor")]
    pub actor: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

impl ApplyArgs {
    fn approvals(&self) -> Approvals {
        Approvals {
            all: self.all,
            additions: self.additions,
            updates: self.updates,
            items: self.items.iter().cloned().collect(),
            notes: self.notes.iter().cloned().collect(),
        }
    }

    fn approves_anything(&self) -> bool {
        self.all
            || self.additions
            || self.updates
            || !self.items.is_empty()
            || !self.notes.is_empty()
    }
}

fn parse_note(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((id, note)) if !id.trim().is_empty() && !note.trim().is_empty() => {
            Ok((id.trim().to_string(), note.trim().to_string()))
        }
        _ => Err(format!("expected ITEM_ID=TEXT, got {input:?}")),
    }
}

fn resolve_proposal(config: &RegistryConfig, path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => Ok(latest_proposal(&config.proposals_dir)?),
    }
}

/// Reconcile `batch` against the store and write (or print) the proposal.
pub(crate) fn reconcile_batch(
    config: &RegistryConfig,
    batch: &CandidateBatch,
    args: &CompareArgs,
) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    // Stamped with the scan time so comparing the same batch again yields the
    // same proposal file.
    let options = ReconcileOptions::new(batch.scan_id.clone(), batch.scanned_at)
        .with_adjacency_window(config.adjacency_window());
    let proposal = reconcile(&batch.candidates, &store, &options);

    let needs_review = !proposal.is_empty() || !proposal.unidentifiable.is_empty();
    let saved = if needs_review && !args.dry_run {
        match find_proposal(&config.proposals_dir, &proposal.proposal_id)? {
            Some(existing) => {
                tracing::info!(path = %existing.display(), "proposal already saved");
                Some((existing, false))
            }
            None => Some((proposal.write_to_dir(&config.proposals_dir)?, true)),
        }
    } else {
        None
    };

    if args.json {
        print_json(&proposal)?;
    } else {
        let saved = saved.as_ref().map(|(path, fresh)| {
            if *fresh {
                SavedProposal::Written(path)
            } else {
                SavedProposal::AlreadySaved(path)
            }
        });
        print_lines(&render_compare_summary(&proposal, saved));
    }
    Ok(EXIT_OK)
}

pub fn run_compare(config: &RegistryConfig, args: CompareArgs) -> anyhow::Result<i32> {
    let path = match &args.candidates {
        Some(path) => path.clone(),
        None => latest_candidate_file(&config.candidates_dir)?.with_context(|| {
            format!(
                "no candidate files in {}; run `nanoreg scan` first",
                config.candidates_dir.display()
            )
        })?,
    };
    let batch = CandidateBatch::read(&path)
        .with_context(|| format!("failed to read candidates {}", path.display()))?;
    tracing::info!(path = %path.display(), scan_id = %batch.scan_id, "comparing");
    reconcile_batch(config, &batch, &args)
}

pub fn run_review(config: &RegistryConfig, args: ReviewArgs) -> anyhow::Result<i32> {
    let path = resolve_proposal(config, args.proposal)?;
    let proposal = Proposal::read(&path)?;
    if args.json {
        print_json(&proposal)?;
    } else {
        let mut lines = vec![format!("File: {}", path.display())];
        lines.extend(render_proposal(&proposal));
        print_lines(&lines);
    }
    Ok(EXIT_OK)
}

#[derive(Serialize)]
struct ApplyReport<'a> {
    proposal_id: &'a str,
    status: &'a str,
    #[serde(flatten)]
    result: &'a ApplyResult,
}

pub fn run_apply(config: &RegistryConfig, args: ApplyArgs) -> anyhow::Result<i32> {
    if !args.approves_anything() {
        bail!("nothing approved: pass item ids, --all, --additions, --updates or --note");
    }
    let approvals = args.approvals();
    let path = resolve_proposal(config, args.proposal)?;
    let ctx = ActorContext::new(args.actor.unwrap_or_else(|| config.actor.clone()));

    let (proposal, result) = apply_file(&config.store_paths(), &path, &approvals, &ctx)
        .with_context(|| format!("failed to apply {}", path.display()))?;

    if args.json {
        print_json(&ApplyReport {
            proposal_id: &proposal.proposal_id,
            status: proposal.status.as_str(),
            result: &result,
        })?;
    } else {
        print_lines(&render_apply(&result, &proposal));
    }

    Ok(if result.has_failures() {
        EXIT_APPLY_FAILED
    } else {
        EXIT_OK
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn notes_split_on_first_equals() {
        assert_eq!(
            parse_note("merge:A+B=keep A, B is a partial=copy").unwrap(),
            (
                "merge:A+B".to_string(),
                "keep A, B is a partial=copy".to_string()
            )
        );
        assert!(parse_note("merge:A+B").is_err());
        assert!(parse_note("=text").is_err());
    }

    #[test]
    fn apply_args_build_approvals() {
        let args = ApplyArgs::try_parse_from([
            "apply",
            "add:r1",
            "--updates",
            "--note",
            "merge:a+b=same run",
        ])
        .unwrap();
        let approvals = args.approvals();
        assert!(approvals.updates);
        assert!(!approvals.all);
        assert!(approvals.items.contains("add:r1"));
        assert_eq!(approvals.note("merge:a+b").as_deref(), Some("same run"));
    }

    #[test]
    fn apply_without_selection_is_refused() {
        let args = ApplyArgs::try_parse_from(["apply", "--latest"]).unwrap();
        assert!(!args.approves_anything());
    }
}
