//! Retry / ignore policy applied around failed commands.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{compile, Result};
use crate::CommandOutput;

/// Session key whose rules apply to every session.
pub const ANY_SESSION: &str = "*";

/// What to do with an output that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Demote the failure to success
    Ignore {
        /// Matching ignore pattern
        pattern: String,
    },
    /// Re-issue the command
    Retry {
        /// Matching retry pattern
        pattern: String,
    },
    /// Propagate the failure
    Fail,
}

/// Per-device retry and ignore rules.
///
/// Rules are matched against every stdout and stderr line. Operation-scoped
/// ignore rules are checked first, then the session's ignore rules (including
/// [`ANY_SESSION`]), then the session's retry rules.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub retry_count: u32,

    /// Sleep between attempts
    pub retry_interval: Duration,

    retry_codes: HashMap<String, Vec<Regex>>,
    ignore_codes: HashMap<String, Vec<Regex>>,
    operation_ignores: HashMap<String, Vec<Regex>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_interval: Duration::from_millis(default_retry_interval_ms()),
            retry_codes: HashMap::new(),
            ignore_codes: HashMap::new(),
            operation_ignores: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries or ignores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Retry when `pattern` matches output in `session`.
    pub fn retry_on(mut self, session: impl Into<String>, pattern: &str) -> Result<Self> {
        self.retry_codes.entry(session.into()).or_default().push(compile(pattern)?);
        Ok(self)
    }

    /// Ignore failures whose output matches `pattern` in `session`.
    pub fn ignore_on(mut self, session: impl Into<String>, pattern: &str) -> Result<Self> {
        self.ignore_codes.entry(session.into()).or_default().push(compile(pattern)?);
        Ok(self)
    }

    /// Ignore failures of `operation` whose output matches `pattern`.
    pub fn ignore_for_operation(mut self, operation: impl Into<String>, pattern: &str) -> Result<Self> {
        self.operation_ignores
            .entry(operation.into())
            .or_default()
            .push(compile(pattern)?);
        Ok(self)
    }

    /// Compile settings into a policy.
    pub fn from_settings(settings: &RetryPolicySettings) -> Result<Self> {
        let mut policy = Self::new()
            .with_retry_count(settings.retry_count)
            .with_retry_interval(Duration::from_millis(settings.retry_interval_ms));
        for (session, patterns) in &settings.retry_codes {
            for pattern in patterns {
                policy = policy.retry_on(session.clone(), pattern)?;
            }
        }
        for (session, patterns) in &settings.ignore_codes {
            for pattern in patterns {
                policy = policy.ignore_on(session.clone(), pattern)?;
            }
        }
        for (operation, patterns) in &settings.operation_ignores {
            for pattern in patterns {
                policy = policy.ignore_for_operation(operation.clone(), pattern)?;
            }
        }
        Ok(policy)
    }

    /// Decide what to do with a failed output.
    pub fn decide(&self, operation: &str, session: Option<&str>, output: &CommandOutput) -> PolicyDecision {
        if let Some(pattern) = first_match(self.operation_ignores.get(operation), output) {
            return PolicyDecision::Ignore { pattern };
        }
        if let Some(pattern) = self.session_match(&self.ignore_codes, session, output) {
            return PolicyDecision::Ignore { pattern };
        }
        if let Some(pattern) = self.session_match(&self.retry_codes, session, output) {
            return PolicyDecision::Retry { pattern };
        }
        PolicyDecision::Fail
    }

    fn session_match(
        &self,
        rules: &HashMap<String, Vec<Regex>>,
        session: Option<&str>,
        output: &CommandOutput,
    ) -> Option<String> {
        session
            .and_then(|s| first_match(rules.get(s), output))
            .or_else(|| first_match(rules.get(ANY_SESSION), output))
    }
}

fn first_match(patterns: Option<&Vec<Regex>>, output: &CommandOutput) -> Option<String> {
    patterns?
        .iter()
        .find(|re| output.lines().any(|line| re.is_match(line)))
        .map(|re| re.as_str().to_string())
}

fn default_retry_interval_ms() -> u64 {
    1000
}

/// Serializable form of a [`RetryPolicy`], as found in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicySettings {
    /// Additional attempts after the first
    #[serde(default)]
    pub retry_count: u32,

    /// Sleep between attempts in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Retry patterns keyed by session (`"*"` for any)
    #[serde(default)]
    pub retry_codes: HashMap<String, Vec<String>>,

    /// Ignore patterns keyed by session (`"*"` for any)
    #[serde(default)]
    pub ignore_codes: HashMap<String, Vec<String>>,

    /// Ignore patterns keyed by operation
    #[serde(default)]
    pub operation_ignores: HashMap<String, Vec<String>>,
}

impl Default for RetryPolicySettings {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_interval_ms: default_retry_interval_ms(),
            retry_codes: HashMap::new(),
            ignore_codes: HashMap::new(),
            operation_ignores: HashMap::new(),
        }
    }
}
