//! Unique identifiers for testrig entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::CoreError;

/// Identity of one run of a unit template.
///
/// Repeatable units are admitted several times; every admission gets the next
/// run number while the template itself is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    /// Template (unit) name
    pub template: String,
    /// 1-based run number
    pub run_number: u32,
}

impl RunId {
    /// Create a run id.
    pub fn new(template: impl Into<String>, run_number: u32) -> Self {
        Self {
            template: template.into(),
            run_number,
        }
    }

    /// The first run of a template.
    pub fn first(template: impl Into<String>) -> Self {
        Self::new(template, 1)
    }

    /// The run that follows this one.
    pub fn next(&self) -> Self {
        Self::new(self.template.clone(), self.run_number + 1)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.template, self.run_number)
    }
}

impl std::str::FromStr for RunId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, run) = s
            .rsplit_once('#')
            .ok_or_else(|| CoreError::InvalidRunId(s.to_string()))?;
        let run_number = run
            .parse()
            .map_err(|_| CoreError::InvalidRunId(s.to_string()))?;
        if name.is_empty() {
            return Err(CoreError::InvalidRunId(s.to_string()));
        }
        Ok(Self::new(name, run_number))
    }
}

/// Unique identifier for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(Ulid);

impl WorkerId {
    /// Generate a new WorkerId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for a logical operation chain.
///
/// Device locks are re-entrant for the chain that holds them, so nested
/// device-locked operations issued by one unit do not deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(Ulid);

impl ChainId {
    /// Generate a new ChainId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display_and_parse() {
        let id = RunId::new("traffic#load", 3);
        assert_eq!(id.to_string(), "traffic#load#3");

        let parsed: RunId = "traffic#load#3".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_run_id_rejects_garbage() {
        assert!("no-run-number".parse::<RunId>().is_err());
        assert!("#4".parse::<RunId>().is_err());
        assert!("name#x".parse::<RunId>().is_err());
    }

    #[test]
    fn test_run_id_next() {
        let id = RunId::first("upgrade");
        assert_eq!(id.run_number, 1);
        assert_eq!(id.next().run_number, 2);
        assert_eq!(id.next().template, "upgrade");
    }
}
