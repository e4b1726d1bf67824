//! Nanopore experiment registry
//!
//! A deduplicating registry of sequencing runs with a reviewable
//! reconciliation workflow:
//!
//! 1. an external scanner produces [`candidates::RawCandidate`]s,
//! 2. [`reconcile::reconcile`] diffs them against the [`store::Store`] and
//!    yields a [`proposal::Proposal`] (additions, updates, merge candidates),
//! 3. an operator reviews the proposal file,
//! 4. [`apply::apply`] commits the approved items, recording every mutation
//!    in the [`events::EventLog`].
//!
//! Nothing reaches the store without going through a proposal or an explicit
//! `upsert`, and suspected duplicates are never merged automatically.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod apply;
pub mod candidates;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod index;
pub mod io;
pub mod proposal;
pub mod reconcile;
pub mod record;
pub mod store;

pub use apply::{ApplyResult, Approvals, ItemOutcome, apply, apply_file};
pub use candidates::{CandidateBatch, RawCandidate};
pub use crate::config::{ConfigLoader, RegistryConfig};
pub use error::{RegistryError, Result};
pub use events::{ActorContext, Event, EventAction, EventLog};
pub use identity::{Fingerprint, dedup_key, fingerprint};
pub use proposal::{Proposal, ProposalStatus};
pub use reconcile::{ReconcileOptions, reconcile};
pub use record::ExperimentRecord;
pub use store::{RecordFilter, Store, StorePaths, StoreStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
