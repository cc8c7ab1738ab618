//! Run configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use testrig_dispatch::{DeviceSet, DeviceSettings};

use crate::error::{ExecutionError, Result};

/// How units are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One unit lifecycle at a time, in list order
    Serial,
    /// Every unit admitted as soon as its dependencies allow
    #[default]
    Parallel,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_grace_ms() -> u64 {
    30_000
}

/// Engine settings as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Admission mode
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Abort the run on the first failure
    #[serde(default)]
    pub stop_on_error: bool,

    /// Scheduler and dependency polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause between consecutive admissions
    #[serde(default)]
    pub wait_between_cases_ms: u64,

    /// Run window; repeatable units are re-admitted until it closes
    #[serde(default)]
    pub run_duration_ms: Option<u64>,

    /// Cap on simultaneously running units (0 or absent: no cap)
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Give up on dependencies after this long
    #[serde(default)]
    pub dependency_timeout_ms: Option<u64>,

    /// How long stop-on-error waits for killed units
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            stop_on_error: false,
            poll_interval_ms: default_poll_interval_ms(),
            wait_between_cases_ms: 0,
            run_duration_ms: None,
            max_concurrent: None,
            dependency_timeout_ms: None,
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Admission mode
    pub mode: ExecutionMode,
    /// Abort the run on the first failure
    pub stop_on_error: bool,
    /// Scheduler and dependency polling interval
    pub poll_interval: Duration,
    /// Pause between consecutive admissions
    pub wait_between_cases: Duration,
    /// Run window (None = run every unit through its bound once)
    pub run_duration: Option<Duration>,
    /// Cap on simultaneously running units
    pub max_concurrent: Option<usize>,
    /// Give up on dependencies after this long
    pub dependency_timeout: Option<Duration>,
    /// How long stop-on-error waits for killed units
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            mode: settings.mode,
            stop_on_error: settings.stop_on_error,
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            wait_between_cases: Duration::from_millis(settings.wait_between_cases_ms),
            run_duration: settings.run_duration_ms.map(Duration::from_millis),
            max_concurrent: settings.max_concurrent.filter(|&n| n > 0),
            dependency_timeout: settings.dependency_timeout_ms.map(Duration::from_millis),
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
        }
    }
}

impl EngineConfig {
    /// Set the admission mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable stop-on-error.
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the pause between admissions.
    pub fn with_wait_between_cases(mut self, wait: Duration) -> Self {
        self.wait_between_cases = wait;
        self
    }

    /// Set the run window.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = Some(duration);
        self
    }

    /// Cap concurrently running units.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max).filter(|&n| n > 0);
        self
    }

    /// Set the dependency wait timeout.
    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = Some(timeout);
        self
    }

    /// Set the stop-on-error grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Devices by name
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSettings>,
}

impl RunConfig {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| ExecutionError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::from(&self.engine)
    }

    /// Build dispatchers for every configured device.
    pub fn device_set(&self) -> Result<DeviceSet> {
        Ok(DeviceSet::from_settings(&self.devices)?)
    }
}
