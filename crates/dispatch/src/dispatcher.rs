//! Command dispatcher: executor resolution, validation, ignore and retry.

use std::sync::{Arc, RwLock};

use testrig_core::ChainId;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};
use crate::lock::DeviceLocks;
use crate::policy::{PolicyDecision, RetryPolicy};
use crate::predicate::{SuccessPredicate, Verdict};
use crate::registry::CapabilityRegistry;
use crate::{CommandOutput, CommandRequest};

/// Issues logical operations to one device.
///
/// Each attempt resolves the executor from the capability registry, takes
/// the device lock, runs the executor and judges the output. Failed outputs
/// are matched against the retry policy snapshot taken when the dispatch
/// started; policy changes only affect later dispatches.
pub struct CommandDispatcher {
    device: String,
    registry: Arc<CapabilityRegistry>,
    policy: RwLock<Arc<RetryPolicy>>,
    default_policy: Arc<RetryPolicy>,
    predicate: SuccessPredicate,
    locks: Arc<DeviceLocks>,
}

impl CommandDispatcher {
    /// Create a dispatcher for `device`.
    pub fn new(device: impl Into<String>, registry: CapabilityRegistry, locks: Arc<DeviceLocks>) -> Self {
        let default_policy = Arc::new(RetryPolicy::default());
        Self {
            device: device.into(),
            registry: Arc::new(registry),
            policy: RwLock::new(default_policy.clone()),
            default_policy,
            predicate: SuccessPredicate::default(),
            locks,
        }
    }

    /// Set the policy used now and restored by [`reset_policy`](Self::reset_policy).
    pub fn with_policy(self, policy: RetryPolicy) -> Self {
        let policy = Arc::new(policy);
        Self {
            policy: RwLock::new(policy.clone()),
            default_policy: policy,
            ..self
        }
    }

    /// Set the success predicate.
    pub fn with_predicate(mut self, predicate: SuccessPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Device name.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Capability registry of this device.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Current policy.
    pub fn policy(&self) -> Arc<RetryPolicy> {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the policy for subsequent dispatches.
    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(policy);
    }

    /// Restore the configured policy.
    pub fn reset_policy(&self) {
        *self.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = self.default_policy.clone();
    }

    /// Block new commands to this device until [`unpause`](Self::unpause).
    pub fn pause(&self) {
        self.locks.pause(&self.device);
    }

    /// Accept new commands again.
    pub fn unpause(&self) {
        self.locks.unpause(&self.device);
    }

    /// Wait for the in-flight command, if any, to finish.
    pub async fn drain(&self) {
        self.locks.drain(&self.device).await;
    }

    /// Dispatch one operation on behalf of `chain`.
    pub async fn dispatch(&self, chain: ChainId, request: CommandRequest) -> Result<CommandOutput> {
        let policy = self.policy();
        let executor = self.registry.resolve(&request.operation)?;
        let session = request.session.as_deref();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut output = {
                let _guard = self.locks.acquire(&self.device, chain).await;
                debug!(
                    device = %self.device,
                    operation = %request.operation,
                    executor = executor.name(),
                    attempt,
                    "dispatching"
                );
                match executor.execute(&request).await {
                    Ok(output) => output,
                    Err(e) => CommandOutput::transport_error(executor.name(), &e),
                }
            };
            output.attempts = attempt;
            if output.executor.is_empty() {
                output.executor = executor.name().to_string();
            }
            output.parse_json_stdout();

            let reason = match self.predicate.evaluate(&output) {
                Verdict::Success => return Ok(output),
                Verdict::Failure(reason) => reason,
            };

            match policy.decide(&request.operation, session, &output) {
                PolicyDecision::Ignore { pattern } => {
                    warn!(
                        device = %self.device,
                        operation = %request.operation,
                        %pattern,
                        %reason,
                        "command failure ignored"
                    );
                    output.ignored_error = true;
                    output.ignored_pattern = Some(pattern);
                    return Ok(output);
                }
                PolicyDecision::Retry { pattern } if attempt <= policy.retry_count => {
                    info!(
                        device = %self.device,
                        operation = %request.operation,
                        %pattern,
                        attempt,
                        retry_count = policy.retry_count,
                        "retrying command"
                    );
                    tokio::time::sleep(policy.retry_interval).await;
                }
                _ => {
                    return Err(DispatchError::CommandFailed {
                        device: self.device.clone(),
                        operation: request.operation.clone(),
                        attempts: attempt,
                        reason,
                        output: Box::new(output),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandExecutor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted outputs, repeating the last one.
    struct Scripted {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandExecutor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn operations(&self) -> Vec<String> {
            vec!["show".to_string()]
        }

        async fn execute(&self, _request: &CommandRequest) -> anyhow::Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.len() > 1 {
                Ok(outputs.remove(0))
            } else {
                Ok(outputs[0].clone())
            }
        }
    }

    fn dispatcher(executor: Arc<Scripted>, policy: RetryPolicy) -> CommandDispatcher {
        let registry = CapabilityRegistry::new(vec![executor]);
        CommandDispatcher::new("dut1", registry, Arc::new(DeviceLocks::new())).with_policy(policy)
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new().with_retry_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "ok", "")]);
        let d = dispatcher(exec.clone(), fast());
        let output = d.dispatch(ChainId::new(), CommandRequest::new("show")).await.unwrap();
        assert_eq!(output.attempts, 1);
        assert!(!output.ignored_error);
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_operation_fails_fast() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "ok", "")]);
        let d = dispatcher(exec.clone(), fast());
        let err = d.dispatch(ChainId::new(), CommandRequest::new("reload")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoExecutor { .. }));
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_bound_is_count_plus_one() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "% Error: device busy", "")]);
        let policy = fast().with_retry_count(3).retry_on("*", "busy").unwrap();
        let d = dispatcher(exec.clone(), policy);

        let err = d.dispatch(ChainId::new(), CommandRequest::new("show")).await.unwrap_err();
        match &err {
            DispatchError::CommandFailed { attempts, output, .. } => {
                assert_eq!(*attempts, 4);
                assert_eq!(output.stdout_lines, vec!["% Error: device busy"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exec.calls(), 4);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let exec = Scripted::new(vec![
            CommandOutput::from_text(0, "% Error: device busy", ""),
            CommandOutput::from_text(0, "done", ""),
        ]);
        let policy = fast().with_retry_count(5).retry_on("*", "busy").unwrap();
        let d = dispatcher(exec.clone(), policy);

        let output = d.dispatch(ChainId::new(), CommandRequest::new("show")).await.unwrap();
        assert_eq!(output.attempts, 2);
        assert_eq!(exec.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_rule_fails_immediately() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "% Error: bad vlan", "")]);
        let policy = fast().with_retry_count(3).retry_on("*", "busy").unwrap();
        let d = dispatcher(exec.clone(), policy);

        assert!(d.dispatch(ChainId::new(), CommandRequest::new("show")).await.is_err());
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_ignore_is_idempotent() {
        let exec = Scripted::new(vec![CommandOutput::from_text(1, "% Error: entry already exists", "")]);
        let policy = fast().ignore_on("config", "already exists").unwrap();
        let d = dispatcher(exec.clone(), policy);

        for _ in 0..3 {
            let request = CommandRequest::new("show").session("config");
            let output = d.dispatch(ChainId::new(), request).await.unwrap();
            assert!(output.ignored_error);
            assert_eq!(output.ignored_pattern.as_deref(), Some("already exists"));
            assert_eq!(output.attempts, 1);
        }
        assert_eq!(exec.calls(), 3);
    }

    #[tokio::test]
    async fn test_transport_error_goes_through_policy() {
        struct Broken;

        #[async_trait]
        impl CommandExecutor for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn operations(&self) -> Vec<String> {
                vec!["show".to_string()]
            }
            async fn execute(&self, _request: &CommandRequest) -> anyhow::Result<CommandOutput> {
                Err(anyhow::anyhow!("connection reset"))
            }
        }

        let registry = CapabilityRegistry::new(vec![Arc::new(Broken)]);
        let d = CommandDispatcher::new("dut1", registry, Arc::new(DeviceLocks::new()))
            .with_policy(fast().with_retry_count(1).retry_on("*", "reset").unwrap());

        let err = d.dispatch(ChainId::new(), CommandRequest::new("show")).await.unwrap_err();
        let output = err.output().unwrap();
        assert_eq!(output.attempts, 2);
        assert_eq!(output.return_code, -1);
        assert_eq!(output.executor, "broken");
    }

    #[tokio::test]
    async fn test_policy_reset() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "ok", "")]);
        let d = dispatcher(exec, fast().with_retry_count(2));
        d.set_policy(RetryPolicy::new().with_retry_count(9));
        assert_eq!(d.policy().retry_count, 9);
        d.reset_policy();
        assert_eq!(d.policy().retry_count, 2);
    }

    #[tokio::test]
    async fn test_parsed_json_output() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "{\"vlans\": [10, 20]}", "")]);
        let d = dispatcher(exec, fast());
        let output = d.dispatch(ChainId::new(), CommandRequest::new("show")).await.unwrap();
        assert_eq!(output.parsed, Some(serde_json::json!({"vlans": [10, 20]})));
    }

    #[tokio::test]
    async fn test_paused_device_blocks_dispatch() {
        let exec = Scripted::new(vec![CommandOutput::from_text(0, "ok", "")]);
        let d = Arc::new(dispatcher(exec.clone(), fast()));
        d.pause();

        let pending = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(ChainId::new(), CommandRequest::new("show")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(exec.calls(), 0);

        d.unpause();
        let output = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(output.attempts, 1);
    }
}
