//! Error types for registry operations
//!
//! Only conditions that abort an operation are errors. Per-item outcomes of a
//! batch (unidentifiable candidates, stale bases, replays, collisions) are
//! reported as data in `Proposal` and `ApplyResult`.

use std::path::PathBuf;
use thiserror::Error;

/// Registry result type alias
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry error taxonomy
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Persisted registry or event log could not be parsed or violates an
    /// invariant. Fatal: nothing loaded from it may be mutated.
    #[error("Malformed store at {path}: {reason}")]
    MalformedStore { path: PathBuf, reason: String },

    #[error("Unsupported registry version {found} at {path} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Another writer saved the registry after this handle loaded it.
    #[error("Registry {path} changed on disk since it was loaded")]
    RegistryChanged { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid candidate file {path}: {reason}")]
    CandidateFile { path: PathBuf, reason: String },

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Invalid proposal file {path}: {reason}")]
    InvalidProposal { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scanner failed: {0}")]
    Scanner(String),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RegistryError::MalformedStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the persisted store cannot be trusted.
    pub fn is_store_load_failure(&self) -> bool {
        matches!(
            self,
            RegistryError::MalformedStore { .. } | RegistryError::UnsupportedVersion { .. }
        )
    }
}

impl From<config::ConfigError> for RegistryError {
    fn from(err: config::ConfigError) -> Self {
        RegistryError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_failures_are_classified() {
        let err = RegistryError::malformed("/tmp/registry.json", "bad json");
        assert!(err.is_store_load_failure());
        assert_eq!(
            err.to_string(),
            "Malformed store at /tmp/registry.json: bad json"
        );

        let err = RegistryError::ProposalNotFound("latest".to_string());
        assert!(!err.is_store_load_failure());

        let err = RegistryError::RegistryChanged {
            path: "/tmp/registry.json".into(),
        };
        assert!(!err.is_store_load_failure());
    }
}
