//! Errors raised while building or validating core models.

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the core models.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A dependency target pattern is not a valid regular expression
    #[error("invalid dependency pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Underlying regex error
        #[source]
        source: regex::Error,
    },

    /// A run id string could not be parsed
    #[error("invalid run id '{0}', expected <name>#<run>")]
    InvalidRunId(String),

    /// A status name could not be parsed
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// A unit specification is inconsistent
    #[error("invalid unit '{unit}': {reason}")]
    InvalidUnit {
        /// Unit name
        unit: String,
        /// What is wrong with it
        reason: String,
    },
}
