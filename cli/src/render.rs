//! Human-readable output. Every renderer returns lines so the text can be
//! asserted on without capturing stdout.

use std::path::Path;

use nanoreg_registry::apply::ItemOutcome;
use nanoreg_registry::proposal::{MergeSide, SideOrigin};
use nanoreg_registry::{
    ApplyResult, Event, ExperimentRecord, Proposal, StoreStats, fingerprint,
};
use serde::Serialize;
use serde_json::Value as JsonValue;

pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

fn checkbox(applied: bool) -> &'static str {
    if applied { "[x]" } else { "[ ]" }
}

fn count(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "-".to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `FLOWCELL DEVICE DATE TIME`, dashes for missing fields.
pub fn identity_summary(record: &ExperimentRecord) -> String {
    let id = &record.identity;
    format!(
        "{} {} {} {}",
        or_dash(id.flowcell.as_deref()),
        or_dash(id.device.as_deref()),
        or_dash(id.date.as_deref()),
        or_dash(id.time.as_deref()),
    )
}

/// One line per run, for `list`.
pub fn record_row(record: &ExperimentRecord) -> String {
    format!(
        "{:<24} {:<40} reads={:<10} {}",
        record.run_id,
        identity_summary(record),
        count(record.ranking.total_reads),
        record.canonical_path
    )
}

pub fn render_record(record: &ExperimentRecord, events: usize) -> Vec<String> {
    let mut lines = vec![
        format!("Run:          {}", record.run_id),
        format!("Fingerprint:  {}", fingerprint(record)),
        format!("Identity:     {}", identity_summary(record)),
        format!("Name:         {}", or_dash(record.experiment_name.as_deref())),
        format!("Reads:        {}", count(record.ranking.total_reads)),
        format!("Bases:        {}", count(record.ranking.total_bases)),
        format!(
            "POD5/summary: {}/{}",
            record.ranking.has_pod5, record.ranking.has_summary
        ),
        format!("Registered:   {}", record.registered_at.to_rfc3339()),
        format!("Updated:      {}", record.updated_at.to_rfc3339()),
        format!("Events:       {events}"),
        "Paths:".to_string(),
    ];
    for path in &record.all_paths {
        let marker = if *path == record.canonical_path { "*" } else { " " };
        lines.push(format!("  {marker} {path}"));
    }
    lines
}

fn side_line(label: &str, side: &MergeSide) -> String {
    let origin = match side.origin {
        SideOrigin::Store => "store",
        SideOrigin::Candidate => "candidate",
    };
    format!(
        "      {label} {} ({origin}) {} reads={} {}",
        side.record.run_id,
        identity_summary(&side.record),
        count(side.record.ranking.total_reads),
        side.record.all_paths.join(", ")
    )
}

pub fn render_proposal(proposal: &Proposal) -> Vec<String> {
    let mut lines = vec![format!(
        "Proposal {} ({}) generated {} from {}",
        proposal.proposal_id,
        proposal.status.as_str(),
        proposal.generated_at.to_rfc3339(),
        proposal.source_scan_id
    )];

    lines.push(format!("Additions ({}):", proposal.additions.len()));
    for item in &proposal.additions {
        lines.push(format!(
            "  {} {}  {}  {}",
            checkbox(item.applied.is_some()),
            item.item_id,
            identity_summary(&item.record),
            item.record.all_paths.join(", ")
        ));
    }

    lines.push(format!("Updates ({}):", proposal.updates.len()));
    for item in &proposal.updates {
        let mut changes: Vec<String> = item
            .field_diffs
            .iter()
            .map(|c| format!("{}: {} -> {}", c.field, value(&c.before), value(&c.after)))
            .collect();
        changes.extend(item.new_paths.iter().map(|p| format!("+path {p}")));
        lines.push(format!(
            "  {} {}  {}",
            checkbox(item.applied.is_some()),
            item.item_id,
            changes.join("; ")
        ));
    }

    lines.push(format!(
        "Merge candidates ({}):",
        proposal.merge_candidates.len()
    ));
    for item in &proposal.merge_candidates {
        lines.push(format!(
            "  {} {}  {}  suggest {} ({})",
            checkbox(item.applied.is_some()),
            item.item_id,
            item.reason.as_str(),
            item.suggested_canonical,
            item.suggestion_reason
        ));
        lines.push(side_line("a:", &item.side_a));
        lines.push(side_line("b:", &item.side_b));
    }

    if !proposal.unidentifiable.is_empty() {
        lines.push(format!("Unidentifiable ({}):", proposal.unidentifiable.len()));
        for item in &proposal.unidentifiable {
            lines.push(format!(
                "  #{} {}  {}",
                item.discovery_index,
                or_dash(Some(item.canonical_path.as_str())),
                item.reason
            ));
        }
    }
    lines.push(format!("Unchanged: {}", proposal.unchanged.len()));
    lines
}

/// Where `compare` left its proposal.
#[derive(Debug, Clone, Copy)]
pub enum SavedProposal<'a> {
    Written(&'a Path),
    /// An identical proposal was already on disk.
    AlreadySaved(&'a Path),
}

/// Short summary printed after `compare`.
pub fn render_compare_summary(proposal: &Proposal, saved: Option<SavedProposal<'_>>) -> Vec<String> {
    let mut lines = vec![format!(
        "{} additions, {} updates, {} merge candidates, {} unidentifiable, {} unchanged",
        proposal.additions.len(),
        proposal.updates.len(),
        proposal.merge_candidates.len(),
        proposal.unidentifiable.len(),
        proposal.unchanged.len()
    )];
    match saved {
        Some(SavedProposal::Written(path)) => {
            lines.push(format!("Proposal written to {}", path.display()))
        }
        Some(SavedProposal::AlreadySaved(path)) => {
            lines.push(format!("Proposal already saved at {}", path.display()))
        }
        None if proposal.is_empty() => lines.push("Nothing to review.".to_string()),
        None => {}
    }
    lines
}

fn outcome_lines(label: &str, outcomes: &[ItemOutcome], lines: &mut Vec<String>) {
    for outcome in outcomes {
        lines.push(format!("  {label:<8} {}  {}", outcome.item_id, outcome.reason));
    }
}

pub fn render_apply(result: &ApplyResult, proposal: &Proposal) -> Vec<String> {
    let mut lines = vec![format!(
        "Applied {}, skipped {}, failed {} (proposal {} is {})",
        result.applied.len(),
        result.skipped.len(),
        result.failed.len(),
        proposal.proposal_id,
        proposal.status.as_str()
    )];
    outcome_lines("applied", &result.applied, &mut lines);
    outcome_lines("skipped", &result.skipped, &mut lines);
    outcome_lines("failed", &result.failed, &mut lines);
    lines
}

pub fn render_stats(stats: &StoreStats, registry: &Path) -> Vec<String> {
    let mut lines = vec![
        format!("Registry:      {}", registry.display()),
        format!("Experiments:   {}", stats.total_experiments),
        format!("Paths:         {}", stats.total_paths),
        format!("Total reads:   {}", stats.total_reads),
        format!("Total bases:   {}", stats.total_bases),
        format!("With POD5:     {}", stats.with_pod5),
        format!("With summary:  {}", stats.with_summary),
        format!("Canonical:     {}", stats.canonical),
        format!("Flowcells:     {}", stats.flowcells),
        format!("Devices:       {}", stats.devices),
    ];
    if !stats.runs_by_device.is_empty() {
        lines.push("Runs by device:".to_string());
        for (device, runs) in &stats.runs_by_device {
            lines.push(format!("  {device:<16} {runs}"));
        }
    }
    lines
}

pub fn render_event(event: &Event) -> String {
    let mut line = format!(
        "#{} {} {} {} {}",
        event.seq,
        event.timestamp.to_rfc3339(),
        event.actor,
        event.action.as_str(),
        event.run_id
    );
    if !event.changes.is_empty() {
        let fields: Vec<&str> = event.changes.iter().map(|c| c.field.as_str()).collect();
        line.push_str(&format!(" [{}]", fields.join(", ")));
    }
    if let Some(item) = &event.item_id {
        line.push_str(&format!(" item={item}"));
    }
    if let Some(note) = &event.note {
        line.push_str(&format!(" note={note:?}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoreg_registry::proposal::{AdditionItem, ProposalStatus};
    use pretty_assertions::assert_eq;

    fn record() -> ExperimentRecord {
        let mut record = ExperimentRecord::new("r1", "/data/r1");
        record.identity.flowcell = Some("FAW12345".to_string());
        record.identity.date = Some("2025-01-01".to_string());
        record.add_path("/backup/r1");
        record
    }

    #[test]
    fn identity_summary_dashes_missing_fields() {
        assert_eq!(identity_summary(&record()), "FAW12345 - 2025-01-01 -");
    }

    #[test]
    fn record_marks_canonical_path() {
        let lines = render_record(&record(), 2);
        assert!(lines.contains(&"  * /data/r1".to_string()));
        assert!(lines.contains(&"    /backup/r1".to_string()));
        assert!(lines.contains(&"Events:       2".to_string()));
    }

    #[test]
    fn proposal_lists_items_with_state() {
        let proposal = Proposal {
            proposal_id: "abcd".to_string(),
            generated_at: "2025-01-01T12:00:00Z".parse().unwrap(),
            source_scan_id: "scan_x".to_string(),
            status: ProposalStatus::Pending,
            additions: vec![AdditionItem {
                item_id: "add:r1".to_string(),
                fingerprint: fingerprint(&record()),
                record: record(),
                applied: None,
            }],
            updates: Vec::new(),
            merge_candidates: Vec::new(),
            unidentifiable: Vec::new(),
            unchanged: vec!["r0".to_string()],
        };
        let lines = render_proposal(&proposal);
        assert_eq!(
            lines[0],
            "Proposal abcd (pending) generated 2025-01-01T12:00:00+00:00 from scan_x"
        );
        assert!(lines[2].starts_with("  [ ] add:r1  FAW12345 - 2025-01-01 -"));
        assert_eq!(lines.last().unwrap(), "Unchanged: 1");
    }

    #[test]
    fn compare_summary_names_reused_proposal() {
        let mut proposal: Proposal = serde_json::from_value(serde_json::json!({
            "proposal_id": "abcd",
            "generated_at": "2025-01-01T12:00:00Z",
            "source_scan_id": "scan_x",
            "additions": [],
            "updates": [],
            "merge_candidates": []
        }))
        .unwrap();
        proposal.unchanged.push("r0".to_string());

        let path = Path::new("/p/proposal_20250101_120000_abcd.json");
        let lines = render_compare_summary(&proposal, Some(SavedProposal::AlreadySaved(path)));
        assert_eq!(
            lines[1],
            "Proposal already saved at /p/proposal_20250101_120000_abcd.json"
        );
        assert_eq!(
            render_compare_summary(&proposal, None),
            vec!["0 additions, 0 updates, 0 merge candidates, 0 unidentifiable, 1 unchanged"]
        );
    }
}
