//! Suite files: units whose phases are shell commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testrig_core::{DependencyClause, UnitSpec};
use testrig_dispatch::CommandRequest;
use testrig_execution::{TestCase, UnitContext, UnitTemplate};
use tracing::debug;

use crate::logs::DirLogRouter;

/// Device used by units that do not name one.
pub const LOCAL_DEVICE: &str = "local";

/// Operation used by units that do not name one.
pub const DEFAULT_OPERATION: &str = "exec";

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    LOCAL_DEVICE.to_string()
}

fn default_operation() -> String {
    DEFAULT_OPERATION.to_string()
}

/// A suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteFile {
    /// Units in admission order
    pub units: Vec<UnitDefinition>,
}

/// One unit as written in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<DependencyClause>,
    pub duration_ms: Option<u64>,
    pub iterations: Option<u32>,
    #[serde(default)]
    pub wait_between_iterations_ms: u64,
    #[serde(default)]
    pub delay_before_start_ms: u64,
    #[serde(default)]
    pub repeatable: bool,
    pub max_runs: Option<u32>,
    #[serde(default = "default_true")]
    pub killable: bool,
    pub timeout_ms: Option<u64>,

    /// Device the commands are dispatched to
    #[serde(default = "default_device")]
    pub device: String,
    /// Operation name the commands are dispatched as
    #[serde(default = "default_operation")]
    pub operation: String,
    /// Session passed to the retry policy
    pub session: Option<String>,

    /// Setup command
    pub pre: Option<String>,
    /// Command run once per iteration
    pub procedure: String,
    /// Cleanup command
    pub post: Option<String>,
}

impl UnitDefinition {
    /// The scheduling part of the definition.
    pub fn spec(&self) -> UnitSpec {
        let mut spec = UnitSpec::new(self.name.clone());
        for alias in &self.aliases {
            spec = spec.alias(alias.clone());
        }
        for clause in &self.depends_on {
            spec = spec.depends_on(clause.clone());
        }
        if let Some(ms) = self.duration_ms {
            spec = spec.with_duration(Duration::from_millis(ms));
        }
        if let Some(n) = self.iterations {
            spec = spec.with_iterations(n);
        }
        spec = spec
            .with_wait_between_iterations(Duration::from_millis(self.wait_between_iterations_ms))
            .with_delay_before_start(Duration::from_millis(self.delay_before_start_ms));
        if self.repeatable {
            spec = spec.repeatable(self.max_runs);
        } else if let Some(max) = self.max_runs {
            spec = spec.with_max_runs(max);
        }
        if !self.killable {
            spec = spec.unkillable();
        }
        if let Some(ms) = self.timeout_ms {
            spec = spec.with_timeout(Duration::from_millis(ms));
        }
        spec
    }
}

impl SuiteFile {
    /// Parse a suite from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a suite file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading suite {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing suite {}", path.display()))
    }

    /// Devices referenced by any unit, deduplicated.
    pub fn devices(&self) -> Vec<&str> {
        let mut devices: Vec<&str> = self.units.iter().map(|u| u.device.as_str()).collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    /// Build one template per unit.
    pub fn templates(&self, logs: Option<Arc<DirLogRouter>>) -> Vec<UnitTemplate> {
        self.units
            .iter()
            .map(|unit| UnitTemplate::new(unit.spec(), ShellCase::new(unit, logs.clone())))
            .collect()
    }
}

/// Runs a unit's phases as commands on its device.
pub struct ShellCase {
    device: String,
    operation: String,
    session: Option<String>,
    pre: Option<String>,
    procedure: String,
    post: Option<String>,
    logs: Option<Arc<DirLogRouter>>,
}

impl ShellCase {
    /// Build the case for a unit definition.
    pub fn new(unit: &UnitDefinition, logs: Option<Arc<DirLogRouter>>) -> Self {
        Self {
            device: unit.device.clone(),
            operation: unit.operation.clone(),
            session: unit.session.clone(),
            pre: unit.pre.clone(),
            procedure: unit.procedure.clone(),
            post: unit.post.clone(),
            logs,
        }
    }

    async fn run_step(&self, ctx: &UnitContext, step: &str, command: &str) -> Result<()> {
        let mut request = CommandRequest::new(self.operation.clone())
            .param("command", command)
            .param(
                "env",
                serde_json::json!({
                    "TESTRIG_RUN": ctx.run_id().to_string(),
                    "TESTRIG_ITERATION": ctx.iteration().to_string(),
                }),
            );
        if let Some(session) = &self.session {
            request = request.session(session.clone());
        }

        debug!(run = %ctx.run_id(), step, command, "dispatching");
        let result = ctx.dispatch(&self.device, request).await;
        if let Some(logs) = &self.logs {
            let transcript = match &result {
                Ok(output) => format!("[{step}] $ {command}\n{}", output.lines().collect::<Vec<_>>().join("\n")),
                Err(e) => format!("[{step}] $ {command}\n{e}"),
            };
            logs.append(ctx.run_id(), &transcript);
        }
        result.with_context(|| format!("{step} step failed"))?;
        Ok(())
    }
}

#[async_trait]
impl TestCase for ShellCase {
    async fn pre_test_case(&self, ctx: &UnitContext) -> Result<()> {
        match &self.pre {
            Some(command) => self.run_step(ctx, "pre", command).await,
            None => Ok(()),
        }
    }

    async fn procedure(&self, ctx: &UnitContext) -> Result<()> {
        self.run_step(ctx, "procedure", &self.procedure).await
    }

    async fn post_test_case(&self, ctx: &UnitContext) -> Result<()> {
        match &self.post {
            Some(command) => self.run_step(ctx, "post", command).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_core::{LoopPolicy, UnitStatus};

    const SUITE: &str = r#"{
        "units": [
            {"name": "setup", "aliases": ["config_base"], "procedure": "true", "killable": false},
            {
                "name": "ping",
                "depends_on": [{"target": "config_.*", "required": "PASS"}],
                "iterations": 3,
                "wait_between_iterations_ms": 5,
                "device": "dut1",
                "pre": "echo pre",
                "procedure": "echo ping",
                "timeout_ms": 1000
            },
            {"name": "soak", "procedure": "true", "repeatable": true, "max_runs": 4, "duration_ms": 200}
        ]
    }"#;

    #[test]
    fn test_parse_and_defaults() {
        let suite = SuiteFile::from_json(SUITE).unwrap();
        assert_eq!(suite.units.len(), 3);
        let setup = &suite.units[0];
        assert_eq!(setup.device, LOCAL_DEVICE);
        assert_eq!(setup.operation, DEFAULT_OPERATION);
        assert!(!setup.killable);
        assert!(suite.units[1].killable);
        assert_eq!(suite.devices(), vec!["dut1", "local"]);
    }

    #[test]
    fn test_spec_conversion() {
        let suite = SuiteFile::from_json(SUITE).unwrap();

        let setup = suite.units[0].spec();
        assert_eq!(setup.aliases, vec!["config_base"]);
        assert!(!setup.killable);

        let ping = suite.units[1].spec();
        assert_eq!(ping.depends_on[0].required, UnitStatus::Pass);
        assert_eq!(ping.loop_policy(), LoopPolicy::Counted(3));
        assert_eq!(ping.timeout, Some(Duration::from_millis(1000)));
        assert!(ping.validate().is_ok());

        let soak = suite.units[2].spec();
        assert!(soak.repeatable);
        assert_eq!(soak.max_runs, Some(4));
        assert!(soak.admits_run(4));
        assert!(!soak.admits_run(5));
    }

    #[test]
    fn test_templates() {
        let suite = SuiteFile::from_json(SUITE).unwrap();
        let names: Vec<_> = suite.templates(None).iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["setup", "ping", "soak"]);
    }

    #[test]
    fn test_missing_procedure_rejected() {
        assert!(SuiteFile::from_json(r#"{"units": [{"name": "x"}]}"#).is_err());
    }
}
