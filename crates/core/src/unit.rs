//! Unit specifications - the immutable part of a schedulable test unit.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::status::UnitStatus;
use crate::{CoreError, Result};

/// A condition requiring a peer unit to reach a status before this unit starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyClause {
    /// Regular expression matched against the whole peer name or any alias
    pub target: String,

    /// Status the matched peers must reach
    pub required: UnitStatus,

    /// Optional clauses do not count towards the required peer count
    #[serde(default)]
    pub optional: bool,
}

impl DependencyClause {
    /// Create a mandatory clause.
    pub fn new(target: impl Into<String>, required: UnitStatus) -> Self {
        Self {
            target: target.into(),
            required,
            optional: false,
        }
    }

    /// Mark the clause optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Compile the target into an anchored matcher.
    pub fn matcher(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.target)).map_err(|source| CoreError::InvalidPattern {
            pattern: self.target.clone(),
            source,
        })
    }
}

/// How the main phase loops, decided once per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPolicy {
    /// Loop while elapsed < duration and iterations remain
    Bounded {
        /// Time bound
        duration: Duration,
        /// Iteration bound
        iterations: u32,
    },
    /// Loop purely on elapsed time
    Timed(Duration),
    /// Loop purely on remaining count
    Counted(u32),
    /// Call `procedure` exactly once
    Once,
}

/// Immutable specification of a unit template.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    /// Unit name, unique within a suite
    pub name: String,

    /// Alternative names matched by dependency clauses
    pub aliases: Vec<String>,

    /// Dependency clauses
    pub depends_on: Vec<DependencyClause>,

    /// Main loop time bound
    pub duration: Option<Duration>,

    /// Main loop iteration bound
    pub iterations: Option<u32>,

    /// Sleep between procedure calls
    pub wait_between_iterations: Duration,

    /// Sleep before the pre phase
    pub delay_before_start: Duration,

    /// Re-admitted after each run while the run window is open
    pub repeatable: bool,

    /// Upper bound on run number
    pub max_runs: Option<u32>,

    /// Whether the scheduler may kill it right away
    pub killable: bool,

    /// Hang timeout for one run
    pub timeout: Option<Duration>,
}

impl UnitSpec {
    /// Create a spec with defaults: run once, no dependencies, killable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            depends_on: Vec::new(),
            duration: None,
            iterations: None,
            wait_between_iterations: Duration::ZERO,
            delay_before_start: Duration::ZERO,
            repeatable: false,
            max_runs: None,
            killable: true,
            timeout: None,
        }
    }

    /// Add an alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Add a dependency clause.
    pub fn depends_on(mut self, clause: DependencyClause) -> Self {
        self.depends_on.push(clause);
        self
    }

    /// Set the main loop time bound.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the main loop iteration bound.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Set the wait between iterations.
    pub fn with_wait_between_iterations(mut self, wait: Duration) -> Self {
        self.wait_between_iterations = wait;
        self
    }

    /// Set the delay before start.
    pub fn with_delay_before_start(mut self, delay: Duration) -> Self {
        self.delay_before_start = delay;
        self
    }

    /// Make the unit repeatable, optionally bounded.
    pub fn repeatable(mut self, max_runs: Option<u32>) -> Self {
        self.repeatable = true;
        self.max_runs = max_runs;
        self
    }

    /// Bound the number of runs without making the unit repeatable.
    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Mark the unit unkillable until it says otherwise.
    pub fn unkillable(mut self) -> Self {
        self.killable = false;
        self
    }

    /// Set a hang timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Main loop policy.
    pub fn loop_policy(&self) -> LoopPolicy {
        match (self.duration, self.iterations) {
            (Some(duration), Some(iterations)) => LoopPolicy::Bounded { duration, iterations },
            (Some(duration), None) => LoopPolicy::Timed(duration),
            (None, Some(iterations)) => LoopPolicy::Counted(iterations),
            (None, None) => LoopPolicy::Once,
        }
    }

    /// Whether a run with this number may still be admitted.
    pub fn admits_run(&self, run_number: u32) -> bool {
        match self.max_runs {
            Some(max) => run_number <= max,
            None => true,
        }
    }

    /// Whether every name of this unit matches a compiled clause matcher.
    pub fn matches(&self, matcher: &Regex) -> bool {
        matcher.is_match(&self.name) || self.aliases.iter().any(|a| matcher.is_match(a))
    }

    /// Check the spec for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidUnit {
                unit: self.name.clone(),
                reason: "empty name".to_string(),
            });
        }
        if self.name.contains('#') {
            return Err(CoreError::InvalidUnit {
                unit: self.name.clone(),
                reason: "'#' is reserved for run numbers".to_string(),
            });
        }
        if self.max_runs == Some(0) {
            return Err(CoreError::InvalidUnit {
                unit: self.name.clone(),
                reason: "max_runs must be at least 1".to_string(),
            });
        }
        for clause in &self.depends_on {
            let matcher = clause.matcher()?;
            if self.matches(&matcher) {
                return Err(CoreError::InvalidUnit {
                    unit: self.name.clone(),
                    reason: format!("dependency '{}' matches the unit itself", clause.target),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_policy_selection() {
        let spec = UnitSpec::new("a");
        assert_eq!(spec.loop_policy(), LoopPolicy::Once);

        let spec = UnitSpec::new("a").with_iterations(3);
        assert_eq!(spec.loop_policy(), LoopPolicy::Counted(3));

        let spec = UnitSpec::new("a").with_duration(Duration::from_secs(1));
        assert_eq!(spec.loop_policy(), LoopPolicy::Timed(Duration::from_secs(1)));

        let spec = UnitSpec::new("a")
            .with_duration(Duration::from_secs(1))
            .with_iterations(2);
        assert_eq!(
            spec.loop_policy(),
            LoopPolicy::Bounded { duration: Duration::from_secs(1), iterations: 2 }
        );
    }

    #[test]
    fn test_clause_matcher_is_anchored() {
        let clause = DependencyClause::new("bgp", UnitStatus::Pass);
        let matcher = clause.matcher().unwrap();
        assert!(matcher.is_match("bgp"));
        assert!(!matcher.is_match("bgp_flap"));

        let clause = DependencyClause::new("bgp.*", UnitStatus::Pass);
        assert!(clause.matcher().unwrap().is_match("bgp_flap"));
    }

    #[test]
    fn test_matches_aliases() {
        let spec = UnitSpec::new("configure_ospf").alias("ospf");
        let matcher = DependencyClause::new("ospf", UnitStatus::Configured).matcher().unwrap();
        assert!(spec.matches(&matcher));
    }

    #[test]
    fn test_admits_run() {
        let spec = UnitSpec::new("a").repeatable(Some(2));
        assert!(spec.admits_run(1));
        assert!(spec.admits_run(2));
        assert!(!spec.admits_run(3));
        assert!(UnitSpec::new("b").admits_run(100));
    }

    #[test]
    fn test_validate() {
        assert!(UnitSpec::new("ok").validate().is_ok());
        assert!(UnitSpec::new("").validate().is_err());
        assert!(UnitSpec::new("a#1").validate().is_err());
        assert!(UnitSpec::new("a").with_max_runs(0).validate().is_err());
        assert!(UnitSpec::new("a")
            .depends_on(DependencyClause::new("(", UnitStatus::Pass))
            .validate()
            .is_err());
        assert!(UnitSpec::new("a")
            .depends_on(DependencyClause::new("a", UnitStatus::Pass))
            .validate()
            .is_err());
    }
}
