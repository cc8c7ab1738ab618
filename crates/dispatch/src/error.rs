//! Errors raised by command dispatch.

use thiserror::Error;

use crate::CommandOutput;

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error type for command dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered executor advertises the operation
    #[error("no executor can perform '{operation}' (registered executors: [{}])", registered.join(", "))]
    NoExecutor {
        /// Requested operation
        operation: String,
        /// Names of every registered executor
        registered: Vec<String>,
    },

    /// The command failed validation and was neither ignored nor recovered by retries
    #[error("'{operation}' failed on {device} after {attempts} attempt(s): {reason}")]
    CommandFailed {
        /// Target device
        device: String,
        /// Requested operation
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Why the last attempt was judged a failure
        reason: String,
        /// Raw output of the last attempt
        output: Box<CommandOutput>,
    },

    /// The device is not configured
    #[error("unknown device '{device}' (configured devices: [{}])", known.join(", "))]
    UnknownDevice {
        /// Requested device
        device: String,
        /// Configured devices
        known: Vec<String>,
    },

    /// A retry, ignore or error-marker pattern is not a valid regular expression
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Underlying regex error
        #[source]
        source: regex::Error,
    },

    /// Device or executor settings are inconsistent
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl DispatchError {
    /// Raw output of a failed command, if any.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            DispatchError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub(crate) fn compile(pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(pattern).map_err(|source| DispatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
