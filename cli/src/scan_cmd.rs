//! `scan` and `register`: getting candidates in.
//!
//! The scanner is an external program. It receives the scan roots as
//! trailing arguments and prints candidates on stdout, as a JSON array,
//! a batch object or JSON lines.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use nanoreg_registry::candidates::intake;
use nanoreg_registry::{ActorContext, CandidateBatch, RegistryConfig, RegistryError};
use serde::Serialize;

use crate::render::{print_json, print_lines};
use crate::review_cmd::{CompareArgs, reconcile_batch};
use crate::{EXIT_OK, open_store};

#[derive(Debug, Parser)]
pub struct ScanArgs {
    /// Directories to scan (default: `scanner.roots` from config).
    pub roots: Vec<PathBuf>,

    /// Import existing scanner output instead of running the scanner.
    #[arg(long = "from", value_name = "FILE", conflicts_with = "roots")]
    pub from: Option<PathBuf>,

    /// Reconcile the new batch right away and write a proposal.
    #[arg(long = "compare")]
    pub compare: bool,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RegisterArgs {
    /// Candidate file (single object, array, batch or JSON lines).
    pub file: PathBuf,

    /// Replace stored records instead of only adding new paths.
    #[arg(long = "force")]
    pub force: bool,

    /// Actor recorded in events (default: `actor` from config).
    #[arg(long = "actor")]
    pub actor: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

/// Run `command` with `roots` appended and return its stdout.
pub fn run_scanner(command: &[String], roots: &[PathBuf]) -> Result<String, RegistryError> {
    let Some((program, args)) = command.split_first() else {
        return Err(RegistryError::Scanner(
            "no scanner configured (set scanner.command or use --from)".to_string(),
        ));
    };

    tracing::info!(%program, roots = roots.len(), "running scanner");
    let output = Command::new(program)
        .args(args)
        .args(roots)
        .output()
        .map_err(|e| RegistryError::Scanner(format!("failed to start {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RegistryError::Scanner(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|e| RegistryError::Scanner(format!("{program} wrote non-UTF-8 output: {e}")))
}

#[derive(Serialize)]
struct ScanReport<'a> {
    scan_id: &'a str,
    candidates: usize,
    path: &'a Path,
}

pub fn run_scan(config: &RegistryConfig, args: ScanArgs) -> anyhow::Result<i32> {
    let now = Utc::now();
    let batch = match &args.from {
        Some(file) => CandidateBatch::read(file)
            .with_context(|| format!("failed to import {}", file.display()))?,
        None => {
            let roots = if args.roots.is_empty() {
                config.scanner.roots.clone()
            } else {
                args.roots.clone()
            };
            if roots.is_empty() {
                bail!("no scan roots given and scanner.roots is empty");
            }
            let stdout = run_scanner(&config.scanner.command, &roots)?;
            let program = config.scanner.command.first().map(String::as_str).unwrap_or_default();
            let mut batch = CandidateBatch::parse(&stdout, Path::new(program), now)?;
            batch.source = serde_json::json!({
                "command": config.scanner.command,
                "roots": roots,
            });
            batch
        }
    };
    let path = batch.write_to_dir(&config.candidates_dir)?;
    tracing::info!(scan_id = %batch.scan_id, candidates = batch.candidates.len(), "saved candidates");

    if args.compare {
        let compare = CompareArgs {
            candidates: Some(path),
            dry_run: false,
            json: args.json,
        };
        return reconcile_batch(config, &batch, &compare);
    }

    if args.json {
        print_json(&ScanReport {
            scan_id: &batch.scan_id,
            candidates: batch.candidates.len(),
            path: &path,
        })?;
    } else {
        print_lines(&[
            format!(
                "Scan {}: {} candidates",
                batch.scan_id,
                batch.candidates.len()
            ),
            format!("Candidates written to {}", path.display()),
        ]);
    }
    Ok(EXIT_OK)
}

#[derive(Serialize)]
struct RegisterOutcome {
    run_id: String,
    applied: bool,
    reason: String,
}

pub fn run_register(config: &RegistryConfig, args: RegisterArgs) -> anyhow::Result<i32> {
    let batch = CandidateBatch::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let mut store = open_store(config)?;
    let ctx = ActorContext::new(args.actor.unwrap_or_else(|| config.actor.clone()));

    let intake = intake(&batch.candidates);
    let mut outcomes = Vec::new();
    for candidate in &intake.identified {
        let outcome = store.upsert(candidate.to_record(), &ctx, args.force)?;
        outcomes.push(RegisterOutcome {
            run_id: candidate.run_id.clone(),
            applied: outcome.applied,
            reason: outcome.reason,
        });
    }
    for skipped in &intake.unidentifiable {
        outcomes.push(RegisterOutcome {
            run_id: String::new(),
            applied: false,
            reason: format!("{}: {}", skipped.canonical_path, skipped.reason),
        });
    }

    if args.json {
        print_json(&outcomes)?;
    } else {
        let lines: Vec<String> = outcomes
            .iter()
            .map(|o| {
                let (state, run_id) = match (o.applied, o.run_id.as_str()) {
                    (_, "") => ("skipped", "-"),
                    (true, run_id) => ("applied", run_id),
                    (false, run_id) => ("unchanged", run_id),
                };
                format!("{state:<10} {run_id}  {}", o.reason)
            })
            .collect();
        print_lines(&lines);
    }
    Ok(EXIT_OK)
}
