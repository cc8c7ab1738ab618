//! Command executor abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A transport able to perform logical operations against a device
/// (CLI over SSH, REST, a local shell, ...).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Get executor name.
    fn name(&self) -> &str;

    /// Operations this executor can perform.
    fn operations(&self) -> Vec<String>;

    /// Execute one request.
    ///
    /// An `Err` means the transport itself failed; a command that ran and
    /// reported an error is an `Ok` output judged later by the success
    /// predicate.
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, anyhow::Error>;
}

/// A logical operation to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Operation name, looked up in the capability registry
    pub operation: String,

    /// Operation parameters
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Active session / view; selects retry and ignore rules
    pub session: Option<String>,

    /// Timeout for one attempt
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    /// Create a request with no parameters.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: BTreeMap::new(),
            session: None,
            timeout: None,
        }
    }

    /// Add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the session / view.
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// String parameter lookup.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Output of one dispatched operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Return code reported by the executor
    pub return_code: i32,

    /// Standard output, one entry per line
    pub stdout_lines: Vec<String>,

    /// Standard error, one entry per line
    pub stderr_lines: Vec<String>,

    /// Structured form of the output, if any
    pub parsed: Option<serde_json::Value>,

    /// A failure was demoted to success by an ignore rule
    #[serde(default)]
    pub ignored_error: bool,

    /// Ignore pattern that matched
    pub ignored_pattern: Option<String>,

    /// Attempts made by the dispatcher
    #[serde(default)]
    pub attempts: u32,

    /// Executor that produced the output
    #[serde(default)]
    pub executor: String,

    /// Duration of the last attempt
    #[serde(default)]
    pub duration: Duration,
}

impl CommandOutput {
    /// Build an output from raw text.
    pub fn from_text(return_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            return_code,
            stdout_lines: split_lines(stdout),
            stderr_lines: split_lines(stderr),
            ..Default::default()
        }
    }

    /// Output describing a transport failure.
    pub fn transport_error(executor: &str, error: &anyhow::Error) -> Self {
        Self {
            return_code: -1,
            stderr_lines: split_lines(&format!("{error:#}")),
            executor: executor.to_string(),
            ..Default::default()
        }
    }

    /// Every line of stdout followed by every line of stderr.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout_lines
            .iter()
            .chain(self.stderr_lines.iter())
            .map(|l| l.as_str())
    }

    /// Stdout joined back into one string.
    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    /// Fill `parsed` from stdout when stdout is a JSON document.
    pub fn parse_json_stdout(&mut self) {
        if self.parsed.is_some() || self.stdout_lines.is_empty() {
            return;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&self.stdout()) {
            self.parsed = Some(value);
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(|l| l.to_string()).collect()
}
