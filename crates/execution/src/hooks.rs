//! Lifecycle hooks.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

use crate::case::UnitContext;
use crate::error::{ExecutionError, Result};
use crate::worker::panic_message;

/// Where in the lifecycle a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Before `pre_test_case`
    BeforePre,
    /// After `pre_test_case` succeeded
    AfterPre,
    /// Before the main loop
    BeforeMain,
    /// After the main loop
    AfterMain,
    /// Before `post_test_case`
    BeforePost,
    /// After `post_test_case`
    AfterPost,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPoint::BeforePre => "before_pre",
            HookPoint::AfterPre => "after_pre",
            HookPoint::BeforeMain => "before_main",
            HookPoint::AfterMain => "after_main",
            HookPoint::BeforePost => "before_post",
            HookPoint::AfterPost => "after_post",
        };
        f.write_str(name)
    }
}

/// A named hook.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Run the hook.
    async fn run(&self, point: HookPoint, ctx: &UnitContext) -> anyhow::Result<()>;
}

/// Runs hooks registered per point, in registration order.
#[derive(Clone, Default)]
pub struct HookRunner {
    hooks: HashMap<HookPoint, Vec<Arc<dyn Hook>>>,
}

impl HookRunner {
    /// Create a runner with no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    pub fn register(&mut self, point: HookPoint, hook: Arc<dyn Hook>) {
        self.hooks.entry(point).or_default().push(hook);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_hook(mut self, point: HookPoint, hook: Arc<dyn Hook>) -> Self {
        self.register(point, hook);
        self
    }

    /// Hooks registered at a point.
    pub fn count(&self, point: HookPoint) -> usize {
        self.hooks.get(&point).map(Vec::len).unwrap_or(0)
    }

    /// Run every hook at `point`, stopping at the first failure.
    pub async fn run(&self, point: HookPoint, ctx: &UnitContext) -> Result<()> {
        let Some(hooks) = self.hooks.get(&point) else {
            return Ok(());
        };
        for hook in hooks {
            debug!(hook = hook.name(), %point, run = %ctx.run_id(), "running hook");
            let message = match AssertUnwindSafe(hook.run(point, ctx)).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            error!(hook = hook.name(), %point, run = %ctx.run_id(), error = %message, "hook failed");
            return Err(ExecutionError::HookFailure {
                point,
                hook: hook.name().to_string(),
                unit: ctx.run_id().to_string(),
                message,
            });
        }
        Ok(())
    }
}
