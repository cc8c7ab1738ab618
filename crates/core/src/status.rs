//! Status vocabulary for units and their phases.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Execution status of a unit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    /// Known but never admitted
    NotRun,
    /// Admitted, worker not yet in a phase
    Admitted,
    /// Worker is inside pre, main or post
    Running,
    /// All phases succeeded
    Pass,
    /// Procedure failed
    Failed,
    /// Pre phase or dependency resolution failed
    ConfigError,
    /// Killed by the scheduler
    Killed,
    /// Detached at stop time while still running
    Incomplete,
    /// Configuration step applied
    Configured,
    /// Configuration step removed
    DeConfigured,
    /// Completed without a pass/fail verdict
    Complete,
}

impl UnitStatus {
    /// Every status, in declaration order.
    pub const ALL: [UnitStatus; 11] = [
        UnitStatus::NotRun,
        UnitStatus::Admitted,
        UnitStatus::Running,
        UnitStatus::Pass,
        UnitStatus::Failed,
        UnitStatus::ConfigError,
        UnitStatus::Killed,
        UnitStatus::Incomplete,
        UnitStatus::Configured,
        UnitStatus::DeConfigured,
        UnitStatus::Complete,
    ];

    /// A status the unit will not transition out of.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Pass
                | UnitStatus::Failed
                | UnitStatus::ConfigError
                | UnitStatus::Killed
                | UnitStatus::Incomplete
                | UnitStatus::Configured
                | UnitStatus::DeConfigured
                | UnitStatus::Complete
        )
    }

    /// A terminal failure status. Triggers stop-on-error.
    pub fn is_failure(self) -> bool {
        matches!(self, UnitStatus::Failed | UnitStatus::ConfigError)
    }

    /// Admitted or inside a phase.
    pub fn is_active(self) -> bool {
        matches!(self, UnitStatus::Admitted | UnitStatus::Running)
    }

    /// Merge precedence: a stored status is never replaced by one with a
    /// lower precedence.
    pub fn precedence(self) -> u8 {
        match self {
            UnitStatus::Failed | UnitStatus::ConfigError => 2,
            UnitStatus::Killed => 1,
            _ => 0,
        }
    }

    /// Upper-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::NotRun => "NOT_RUN",
            UnitStatus::Admitted => "ADMITTED",
            UnitStatus::Running => "RUNNING",
            UnitStatus::Pass => "PASS",
            UnitStatus::Failed => "FAILED",
            UnitStatus::ConfigError => "CONFIG_ERROR",
            UnitStatus::Killed => "KILLED",
            UnitStatus::Incomplete => "INCOMPLETE",
            UnitStatus::Configured => "CONFIGURED",
            UnitStatus::DeConfigured => "DE_CONFIGURED",
            UnitStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        UnitStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .or(match normalized.as_str() {
                "PASSED" => Some(UnitStatus::Pass),
                "DECONFIGURED" => Some(UnitStatus::DeConfigured),
                _ => None,
            })
            .ok_or_else(|| CoreError::UnknownStatus(s.to_string()))
    }
}

/// Coarse lifecycle stage of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Registered, not admitted
    Pending,
    /// Admitted for execution
    Admitted,
    /// Worker running
    Running,
    /// Final record committed
    Done,
}

/// One of the three lifecycle phases of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// `pre_test_case`
    Pre,
    /// `procedure` loop
    Main,
    /// `post_test_case`
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => write!(f, "pre"),
            Phase::Main => write!(f, "main"),
            Phase::Post => write!(f, "post"),
        }
    }
}
