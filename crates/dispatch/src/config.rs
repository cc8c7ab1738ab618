//! Device configuration and the set of dispatchers built from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::builtin::ShellExecutor;
use crate::dispatcher::CommandDispatcher;
use crate::error::{DispatchError, Result};
use crate::lock::DeviceLocks;
use crate::policy::{RetryPolicy, RetryPolicySettings};
use crate::predicate::{SuccessPredicate, DEFAULT_ERROR_MARKERS};
use crate::registry::CapabilityRegistry;
use crate::CommandExecutor;

/// One executor attached to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Executor kind; only `shell` is built in
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Executor name, unique per device
    pub name: String,

    /// Operations it serves
    #[serde(default)]
    pub operations: Vec<String>,

    /// Shell binary for `shell` executors
    pub shell: Option<String>,
}

fn default_kind() -> String {
    "shell".to_string()
}

fn default_true() -> bool {
    true
}

/// Settings for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Executors in preference order
    #[serde(default)]
    pub executors: Vec<ExecutorSettings>,

    /// Retry and ignore rules
    #[serde(default)]
    pub retry: RetryPolicySettings,

    /// Error markers; the built-in set when absent
    #[serde(default)]
    pub error_markers: Option<Vec<String>>,

    /// Treat a non-zero return code as failure
    #[serde(default = "default_true")]
    pub check_return_code: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            executors: Vec::new(),
            retry: RetryPolicySettings::default(),
            error_markers: None,
            check_return_code: true,
        }
    }
}

impl DeviceSettings {
    /// Build the executors described by these settings.
    pub fn build_executors(&self) -> Result<Vec<Arc<dyn CommandExecutor>>> {
        self.executors
            .iter()
            .map(|e| match e.kind.as_str() {
                "shell" => {
                    let mut shell = ShellExecutor::new(e.name.clone(), e.operations.clone());
                    if let Some(bin) = &e.shell {
                        shell = shell.with_shell(bin.clone());
                    }
                    Ok(Arc::new(shell) as Arc<dyn CommandExecutor>)
                }
                other => Err(DispatchError::InvalidSettings(format!(
                    "executor '{}' has unsupported kind '{}'",
                    e.name, other
                ))),
            })
            .collect()
    }

    /// Build the success predicate.
    pub fn predicate(&self) -> Result<SuccessPredicate> {
        match &self.error_markers {
            Some(markers) => SuccessPredicate::new(markers, self.check_return_code),
            None => SuccessPredicate::new(DEFAULT_ERROR_MARKERS, self.check_return_code),
        }
    }
}

/// Every configured device, sharing one lock table.
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: BTreeMap<String, Arc<CommandDispatcher>>,
    locks: Arc<DeviceLocks>,
}

impl DeviceSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build dispatchers for every configured device.
    pub fn from_settings(settings: &BTreeMap<String, DeviceSettings>) -> Result<Self> {
        let mut set = Self::new();
        for (name, device) in settings {
            let registry = CapabilityRegistry::new(device.build_executors()?);
            let dispatcher = CommandDispatcher::new(name.clone(), registry, set.locks.clone())
                .with_policy(RetryPolicy::from_settings(&device.retry)?)
                .with_predicate(device.predicate()?);
            set.devices.insert(name.clone(), Arc::new(dispatcher));
        }
        Ok(set)
    }

    /// Add a device served by `executors` with the given policy.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        executors: Vec<Arc<dyn CommandExecutor>>,
        policy: RetryPolicy,
    ) -> Arc<CommandDispatcher> {
        let name = name.into();
        let dispatcher = Arc::new(
            CommandDispatcher::new(name.clone(), CapabilityRegistry::new(executors), self.locks.clone())
                .with_policy(policy),
        );
        self.devices.insert(name, dispatcher.clone());
        dispatcher
    }

    /// Dispatcher for `device`.
    pub fn get(&self, device: &str) -> Result<Arc<CommandDispatcher>> {
        self.devices
            .get(device)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownDevice {
                device: device.to_string(),
                known: self.names(),
            })
    }

    /// Configured device names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Shared lock table.
    pub fn locks(&self) -> &Arc<DeviceLocks> {
        &self.locks
    }

    /// Whether no device is configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
