//! Read-only registry queries.

use anyhow::bail;
use clap::Parser;
use nanoreg_registry::{ExperimentRecord, RecordFilter, RegistryConfig, fingerprint};
use serde::Serialize;

use crate::render::{
    print_json, print_lines, record_row, render_event, render_record, render_stats,
};
use crate::{EXIT_OK, open_store};

#[derive(Debug, Parser)]
pub struct StatsArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Only runs on this flowcell.
    #[arg(long = "flowcell")]
    pub flowcell: Option<String>,

    /// Only runs on this device.
    #[arg(long = "device")]
    pub device: Option<String>,

    /// Only runs with this experiment name.
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Run id.
    pub run_id: String,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct HistoryArgs {
    /// Only events for this run.
    pub run_id: Option<String>,

    /// Show only the last N events.
    #[arg(long = "limit", short = 'n')]
    pub limit: Option<usize>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

pub fn run_stats(config: &RegistryConfig, args: StatsArgs) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let stats = store.stats();
    if args.json {
        print_json(&stats)?;
    } else {
        print_lines(&render_stats(&stats, store.registry_path()));
    }
    Ok(EXIT_OK)
}

pub fn run_list(config: &RegistryConfig, args: ListArgs) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let filter = RecordFilter {
        flowcell: args.flowcell,
        device: args.device,
        experiment_name: args.name,
    };
    let records = store.query(&filter);
    if args.json {
        print_json(&records)?;
    } else {
        let mut lines: Vec<String> = records.iter().map(|r| record_row(r)).collect();
        lines.push(format!("{} runs", records.len()));
        print_lines(&lines);
    }
    Ok(EXIT_OK)
}

#[derive(Serialize)]
struct GetReport<'a> {
    fingerprint: String,
    #[serde(flatten)]
    record: &'a ExperimentRecord,
}

pub fn run_get(config: &RegistryConfig, args: GetArgs) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let Some(record) = store.get(&args.run_id) else {
        bail!("run {} is not registered", args.run_id);
    };
    if args.json {
        print_json(&GetReport {
            fingerprint: fingerprint(record).to_string(),
            record,
        })?;
    } else {
        let events = store.events().for_run(&record.run_id)?.len();
        print_lines(&render_record(record, events));
    }
    Ok(EXIT_OK)
}

pub fn run_history(config: &RegistryConfig, args: HistoryArgs) -> anyhow::Result<i32> {
    let store = open_store(config)?;
    let mut events = match &args.run_id {
        Some(run_id) => store.events().for_run(run_id)?,
        None => store.events().read_all()?,
    };
    if let Some(limit) = args.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }

    if args.json {
        print_json(&events)?;
    } else {
        let lines: Vec<String> = events.iter().map(render_event).collect();
        print_lines(&lines);
    }
    Ok(EXIT_OK)
}
