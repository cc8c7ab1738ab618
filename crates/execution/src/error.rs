//! Execution errors.

use testrig_core::{CoreError, RunSummary};
use testrig_dispatch::DispatchError;
use thiserror::Error;

use crate::hooks::HookPoint;

/// Result alias for the execution layer.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Error type for the execution layer.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Dependency clauses of a unit can never be satisfied
    #[error("dependencies of '{unit}' cannot be satisfied: {reason}")]
    DependencyUnsatisfied {
        /// Waiting unit
        unit: String,
        /// Diagnostic
        reason: String,
    },

    /// A lifecycle hook failed
    #[error("hook '{hook}' failed at {point} for '{unit}': {message}")]
    HookFailure {
        /// Hook point
        point: HookPoint,
        /// Hook name
        hook: String,
        /// Unit run
        unit: String,
        /// Error text
        message: String,
    },

    /// stop_on_error triggered; the run was aborted
    #[error("run stopped on error in '{unit}' ({summary})")]
    StopOnError {
        /// Run that failed first
        unit: String,
        /// Counts at the time the run ended
        summary: RunSummary,
    },

    /// No unit with this name
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    /// Unit is not currently tracked by the scheduler
    #[error("unit '{0}' is not running")]
    NotRunning(String),

    /// Two units share a name
    #[error("duplicate unit '{0}'")]
    DuplicateUnit(String),

    /// A run is already in progress on this engine
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// Invalid unit specification
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device setup failed
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
