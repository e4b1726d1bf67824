//! `nanoreg` command-line interface.
//!
//! ## Commands
//!
//! - `nanoreg scan [ROOTS...] [--from FILE] [--compare]`
//! - `nanoreg compare [CANDIDATES]`
//! - `nanoreg review [PROPOSAL | --latest]`
//! - `nanoreg apply [--proposal FILE | --latest] [ITEM...] [--all|--additions|--updates] [--note ITEM=TEXT]`
//! - `nanoreg stats | list | get RUN_ID | history [RUN_ID]`
//! - `nanoreg register FILE [--force]`
//!
//! ## Exit Codes
//! - 0: Success
//! - 1: Apply reported at least one failed item
//! - 2: Registry or event log could not be loaded
//! - 3: Any other error (configuration, I/O, usage, scanner)

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use nanoreg_registry::{ConfigLoader, RegistryConfig, RegistryError, Store};

pub mod query_cmd;
pub mod render;
pub mod review_cmd;
pub mod scan_cmd;

pub const EXIT_OK: i32 = 0;
pub const EXIT_APPLY_FAILED: i32 = 1;
pub const EXIT_STORE_LOAD: i32 = 2;
pub const EXIT_ERROR: i32 = 3;

/// Experiment registry and discovery reconciliation.
#[derive(Debug, Parser)]
#[command(name = "nanoreg", version)]
pub struct Cli {
    /// Config file (TOML). Defaults to ./nanoreg.toml, then ~/.config/nanoreg/config.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Registry file (overrides `registry_path`).
    #[arg(long, global = true)]
    pub registry: Option<PathBuf>,

    /// Event log (overrides `events_path`).
    #[arg(long, global = true)]
    pub events: Option<PathBuf>,

    /// Proposal directory (overrides `proposals_dir`).
    #[arg(long = "proposals-dir", global = true)]
    pub proposals_dir: Option<PathBuf>,

    /// Candidate directory (overrides `candidates_dir`).
    #[arg(long = "candidates-dir", global = true)]
    pub candidates_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the discovery scanner and save its candidates.
    Scan(scan_cmd::ScanArgs),
    /// Reconcile a candidate file against the registry and write a proposal.
    Compare(review_cmd::CompareArgs),
    /// Show a proposal for review.
    Review(review_cmd::ReviewArgs),
    /// Apply approved proposal items to the registry.
    Apply(review_cmd::ApplyArgs),
    /// Registry summary.
    Stats(query_cmd::StatsArgs),
    /// List registered runs.
    List(query_cmd::ListArgs),
    /// Show one run.
    Get(query_cmd::GetArgs),
    /// Show the event log.
    History(query_cmd::HistoryArgs),
    /// Register runs from a candidate file directly, without a proposal.
    Register(scan_cmd::RegisterArgs),
}

impl Cli {
    /// Layered config with command-line overrides applied.
    pub fn load_config(&self) -> anyhow::Result<RegistryConfig> {
        let loaded = match &self.config {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::load_default(),
        };
        let mut config = loaded.context("failed to load configuration")?;

        if let Some(path) = &self.registry {
            config.registry_path = path.clone();
        }
        if let Some(path) = &self.events {
            config.events_path = Some(path.clone());
        }
        if let Some(dir) = &self.proposals_dir {
            config.proposals_dir = dir.clone();
        }
        if let Some(dir) = &self.candidates_dir {
            config.candidates_dir = dir.clone();
        }
        Ok(config)
    }
}

/// Load the store named by `config`.
pub(crate) fn open_store(config: &RegistryConfig) -> anyhow::Result<Store> {
    Store::load(config.store_paths())
        .with_context(|| format!("failed to load registry {}", config.registry_path.display()))
}

/// Run a parsed command line. Returns the process exit code.
pub fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.load_config()?;
    tracing::debug!(command = ?cli.command, "dispatching");

    match cli.command {
        Command::Scan(args) => scan_cmd::run_scan(&config, args),
        Command::Compare(args) => review_cmd::run_compare(&config, args),
        Command::Review(args) => review_cmd::run_review(&config, args),
        Command::Apply(args) => review_cmd::run_apply(&config, args),
        Command::Stats(args) => query_cmd::run_stats(&config, args),
        Command::List(args) => query_cmd::run_list(&config, args),
        Command::Get(args) => query_cmd::run_get(&config, args),
        Command::History(args) => query_cmd::run_history(&config, args),
        Command::Register(args) => scan_cmd::run_register(&config, args),
    }
}

/// Exit code for an error that aborted a command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let store_failure = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<RegistryError>())
        .any(RegistryError::is_store_load_failure);
    if store_failure {
        EXIT_STORE_LOAD
    } else {
        EXIT_ERROR
    }
}

/// Initialise stderr logging. Default level is `warn`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
