//! Layered configuration.
//!
//! Sources, lowest priority first: built-in defaults, a TOML file, then
//! `NANOREG_*` environment variables (`__` separates nested keys, e.g.
//! `NANOREG_RECONCILE__ADJACENCY_WINDOW_MINUTES=60`). Command-line flags are
//! applied on top by the binary.

use std::path::{Path, PathBuf};

use chrono::Duration;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::reconcile::DEFAULT_ADJACENCY_WINDOW_MINUTES;
use crate::store::StorePaths;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NANOREG";

/// Longest accepted adjacency window: one week.
pub const MAX_ADJACENCY_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry JSON file
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Event log; defaults to `<registry stem>.events.jsonl` next to the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_path: Option<PathBuf>,

    /// Where proposals are written
    #[serde(default = "default_proposals_dir")]
    pub proposals_dir: PathBuf,

    /// Where scanner batches are written
    #[serde(default = "default_candidates_dir")]
    pub candidates_dir: PathBuf,

    /// Name recorded in events and applied markers
    #[serde(default = "default_actor")]
    pub actor: String,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// External discovery scanner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Program and arguments; the roots are appended
    #[serde(default)]
    pub command: Vec<String>,

    /// Directories to scan when none are given on the command line
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Start-time window for pairing runs on one flowcell
    #[serde(default = "default_adjacency_window_minutes")]
    pub adjacency_window_minutes: i64,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nanoreg")
}
fn default_registry_path() -> PathBuf {
    data_dir().join("registry.json")
}
fn default_proposals_dir() -> PathBuf {
    data_dir().join("proposals")
}
fn default_candidates_dir() -> PathBuf {
    data_dir().join("candidates")
}
fn default_actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
fn default_adjacency_window_minutes() -> i64 {
    DEFAULT_ADJACENCY_WINDOW_MINUTES
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            adjacency_window_minutes: default_adjacency_window_minutes(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            events_path: None,
            proposals_dir: default_proposals_dir(),
            candidates_dir: default_candidates_dir(),
            actor: default_actor(),
            scanner: ScannerConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn store_paths(&self) -> StorePaths {
        let paths = StorePaths::new(&self.registry_path);
        match &self.events_path {
            Some(events) => paths.with_events(events),
            None => paths,
        }
    }

    pub fn adjacency_window(&self) -> Duration {
        let minutes = self
            .reconcile
            .adjacency_window_minutes
            .clamp(0, MAX_ADJACENCY_WINDOW_MINUTES);
        Duration::try_minutes(minutes).unwrap_or_else(Duration::zero)
    }

    fn validate(&self) -> Result<()> {
        if self.registry_path.as_os_str().is_empty() {
            return Err(RegistryError::Config("registry_path is empty".to_string()));
        }
        let window = self.reconcile.adjacency_window_minutes;
        if !(0..=MAX_ADJACENCY_WINDOW_MINUTES).contains(&window) {
            return Err(RegistryError::Config(format!(
                "reconcile.adjacency_window_minutes must be between 0 and \
                 {MAX_ADJACENCY_WINDOW_MINUTES} (got {window})"
            )));
        }
        Ok(())
    }
}

/// Configuration loader with layered merging
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path. A missing file is an error.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Merge defaults, the config file (if set) and `NANOREG_*` variables.
    pub fn load(&self) -> Result<RegistryConfig> {
        let defaults = serde_json::to_string(&RegistryConfig::default())?;
        let mut builder =
            Config::builder().add_source(File::from_str(&defaults, config::FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(RegistryError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("scanner.command")
                .with_list_parse_key("scanner.roots"),
        );

        let config: RegistryConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(
            registry = %config.registry_path.display(),
            file = ?self.config_path,
            "loaded configuration"
        );
        Ok(config)
    }

    /// Locate the config file in standard locations:
    /// 1. Current directory: ./nanoreg.toml
    /// 2. XDG config: ~/.config/nanoreg/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./nanoreg.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("nanoreg").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Load from the first config file found, or defaults plus environment.
    pub fn load_default() -> Result<RegistryConfig> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults_live_under_data_dir() {
        let config = RegistryConfig::default();
        assert!(config.registry_path.ends_with("nanoreg/registry.json"));
        assert!(config.proposals_dir.ends_with("nanoreg/proposals"));
        assert_eq!(config.reconcile.adjacency_window_minutes, 120);
        assert!(config.scanner.command.is_empty());
    }

    #[test]
    fn store_paths_honour_events_override() {
        let mut config = RegistryConfig {
            registry_path: PathBuf::from("/srv/reg/registry.json"),
            ..Default::default()
        };
        assert_eq!(
            config.store_paths().events,
            PathBuf::from("/srv/reg/registry.events.jsonl")
        );

        config.events_path = Some(PathBuf::from("/var/log/nanoreg.jsonl"));
        assert_eq!(
            config.store_paths().events,
            PathBuf::from("/var/log/nanoreg.jsonl")
        );
    }

    #[test]
    #[serial]
    fn load_with_toml_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nanoreg.toml");
        std::fs::write(
            &config_path,
            r#"
registry_path = "/srv/nanoreg/registry.json"
actor = "lab-bot"

[scanner]
command = ["nanopore-scan", "--json"]
roots = ["/data/runs"]

[reconcile]
adjacency_window_minutes = 45
"#,
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(&config_path).load().unwrap();
        assert_eq!(config.registry_path, PathBuf::from("/srv/nanoreg/registry.json"));
        assert_eq!(config.actor, "lab-bot");
        assert_eq!(config.scanner.command, vec!["nanopore-scan", "--json"]);
        assert_eq!(config.scanner.roots, vec![PathBuf::from("/data/runs")]);
        assert_eq!(config.adjacency_window(), Duration::minutes(45));
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nanoreg.toml");
        std::fs::write(
            &config_path,
            "actor = \"from-file\"\n[reconcile]\nadjacency_window_minutes = 45\n",
        )
        .unwrap();

        unsafe {
            env::set_var("NANOREG_RECONCILE__ADJACENCY_WINDOW_MINUTES", "10");
        }
        let config = ConfigLoader::new().with_file(&config_path).load();
        unsafe {
            env::remove_var("NANOREG_RECONCILE__ADJACENCY_WINDOW_MINUTES");
        }

        let config = config.unwrap();
        assert_eq!(config.reconcile.adjacency_window_minutes, 10);
        assert_eq!(config.actor, "from-file");
    }

    #[test]
    #[serial]
    fn env_sets_top_level_paths() {
        unsafe {
            env::set_var("NANOREG_REGISTRY_PATH", "/tmp/nanoreg-env/registry.json");
        }
        let config = ConfigLoader::new().load();
        unsafe {
            env::remove_var("NANOREG_REGISTRY_PATH");
        }

        assert_eq!(
            config.unwrap().registry_path,
            PathBuf::from("/tmp/nanoreg-env/registry.json")
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/nanoreg.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[test]
    #[serial]
    fn negative_window_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nanoreg.toml");
        std::fs::write(&config_path, "[reconcile]\nadjacency_window_minutes = -5\n").unwrap();

        let err = ConfigLoader::new().with_file(&config_path).load().unwrap_err();
        assert!(err.to_string().contains("adjacency_window_minutes"));
    }

    #[test]
    #[serial]
    fn oversized_window_is_rejected() {
        unsafe {
            env::set_var("NANOREG_RECONCILE__ADJACENCY_WINDOW_MINUTES", "9999999999999999");
        }
        let result = ConfigLoader::new().load();
        unsafe {
            env::remove_var("NANOREG_RECONCILE__ADJACENCY_WINDOW_MINUTES");
        }

        let err = result.unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
        assert!(err.to_string().contains("between 0 and 10080"));

        let config = RegistryConfig {
            reconcile: ReconcileConfig {
                adjacency_window_minutes: i64::MAX,
            },
            ..Default::default()
        };
        assert_eq!(config.adjacency_window(), Duration::minutes(10080));
    }
}
