//! testrig core data models.
//!
//! This crate defines the data structures shared by the status store, the
//! command dispatcher and the execution engine: identities, statuses, unit
//! specifications and the per-run status records.

#![warn(missing_docs)]

// Identities
mod id;

// Status vocabulary
mod status;

// Units and their records
mod unit;
mod record;
mod summary;

mod error;

// Re-exports
pub use id::*;

pub use status::{UnitStatus, Stage, Phase};
pub use unit::{DependencyClause, UnitSpec, LoopPolicy};
pub use record::{StatusRecord, StatusUpdate, FailureReason, FailureKind};
pub use summary::RunSummary;
pub use error::{CoreError, Result};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
