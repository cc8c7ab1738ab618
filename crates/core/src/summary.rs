//! Aggregate run result handed to reporting consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::record::StatusRecord;
use crate::status::UnitStatus;

/// Counts of unit runs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Never admitted
    pub not_run: usize,
    /// Passed
    pub pass: usize,
    /// Procedure failures
    pub failed: usize,
    /// Pre-phase or dependency failures
    pub config_error: usize,
    /// Admitted or running
    pub running: usize,
    /// Killed
    pub killed: usize,
    /// Stopped before finishing
    pub incomplete: usize,
    /// Complete, configured or de-configured
    pub complete: usize,
    /// Total records counted
    pub total: usize,
}

impl RunSummary {
    /// Count a set of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StatusRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.add(record.status);
        }
        summary
    }

    /// Count one status.
    pub fn add(&mut self, status: UnitStatus) {
        self.total += 1;
        match status {
            UnitStatus::NotRun => self.not_run += 1,
            UnitStatus::Admitted | UnitStatus::Running => self.running += 1,
            UnitStatus::Pass => self.pass += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::ConfigError => self.config_error += 1,
            UnitStatus::Killed => self.killed += 1,
            UnitStatus::Incomplete => self.incomplete += 1,
            UnitStatus::Configured | UnitStatus::DeConfigured | UnitStatus::Complete => {
                self.complete += 1
            }
        }
    }

    /// Number of failed runs of either failure kind.
    pub fn failures(&self) -> usize {
        self.failed + self.config_error
    }

    /// No failures, kills or incomplete runs.
    pub fn is_clean(&self) -> bool {
        self.failures() == 0 && self.killed == 0 && self.incomplete == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} pass={} failed={} config_error={} killed={} incomplete={} complete={} running={} not_run={}",
            self.total,
            self.pass,
            self.failed,
            self.config_error,
            self.killed,
            self.incomplete,
            self.complete,
            self.running,
            self.not_run,
        )
    }
}
