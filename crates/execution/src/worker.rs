//! Unit lifecycle: pre, main loop, post.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;

use testrig_core::{FailureKind, FailureReason, LoopPolicy, Phase, Stage, StatusUpdate, UnitStatus};
use testrig_storage::StatusStore;
use tracing::{debug, info, warn};

use crate::case::{LogRouter, UnitContext, UnitTemplate};
use crate::hooks::{HookPoint, HookRunner};

type PhaseResult = std::result::Result<(), FailureReason>;

/// Runs one unit run from admission to its final record.
pub(crate) struct Worker {
    pub template: UnitTemplate,
    pub ctx: Arc<UnitContext>,
    pub store: Arc<StatusStore>,
    pub hooks: Arc<HookRunner>,
    pub log_router: Arc<dyn LogRouter>,
}

impl Worker {
    /// Drive the lifecycle and commit the final record. Returns the
    /// committed status.
    pub async fn run(self) -> UnitStatus {
        let run_id = self.ctx.run_id().clone();
        let control = self.ctx.control().clone();
        let started = chrono::Utc::now();

        let mut start = StatusUpdate::new()
            .stage(Stage::Running)
            .status(UnitStatus::Running)
            .phase(Some(Phase::Pre))
            .worker(self.ctx.worker())
            .started_at(started);
        if let Some(log_ref) = self.log_router.switch_to(&run_id) {
            start = start.log_ref(log_ref);
        }
        if self
            .store
            .upsert_if(&run_id, |record| !record.is_terminal(), start)
            .await
            .is_none()
        {
            debug!("run settled before it started");
            control.finish();
            return self.store.status(&run_id).await.unwrap_or(UnitStatus::Killed);
        }
        info!(worker = %self.ctx.worker(), "unit started");

        let spec = self.template.spec.clone();
        let mut status = UnitStatus::Pass;

        control.sleep(spec.delay_before_start).await;
        if !control.checkpoint().await {
            if let Err(reason) = self.pre().await {
                status = UnitStatus::ConfigError;
                self.record_failure(reason).await;
            }
        }

        if status == UnitStatus::Pass && !control.checkpoint().await {
            if let Err(reason) = self.main_loop(spec.loop_policy()).await {
                status = UnitStatus::Failed;
                self.record_failure(reason).await;
            }
        }

        // Suspension is honoured here too; a kill never skips cleanup.
        control.checkpoint().await;
        let post_status = match self.post().await {
            Ok(()) => UnitStatus::Pass,
            Err(reason) => {
                self.record_failure(reason).await;
                UnitStatus::Failed
            }
        };

        let update = if control.is_killed() && !status.is_failure() {
            // The kill already stamped the end time.
            StatusUpdate::new()
                .stage(Stage::Done)
                .status(UnitStatus::Killed)
                .phase(None)
                .post_status(post_status)
        } else {
            StatusUpdate::finished(status, Some(started)).post_status(post_status)
        };
        let record = self.store.upsert(&run_id, update).await;
        control.finish();

        info!(
            status = %record.status,
            post_status = %post_status,
            iterations = record.iterations,
            "unit finished"
        );
        record.status
    }

    async fn pre(&self) -> PhaseResult {
        let ctx = self.ctx.as_ref();
        self.hook(HookPoint::BeforePre, Phase::Pre).await?;
        guarded(self.template.case.pre_test_case(ctx), FailureKind::Precondition, Phase::Pre).await?;
        self.hook(HookPoint::AfterPre, Phase::Pre).await
    }

    async fn main_loop(&self, policy: LoopPolicy) -> PhaseResult {
        let ctx = self.ctx.as_ref();
        let control = ctx.control();
        self.store
            .upsert(ctx.run_id(), StatusUpdate::new().phase(Some(Phase::Main)))
            .await;
        self.hook(HookPoint::BeforeMain, Phase::Main).await?;

        let wait = self.template.spec.wait_between_iterations;
        let start = Instant::now();
        let mut done = 0u32;
        while continues(policy, done, start.elapsed()) {
            ctx.set_iteration(done + 1);
            if let Err(mut reason) =
                guarded(self.template.case.procedure(ctx), FailureKind::Procedure, Phase::Main).await
            {
                reason.message = format!("iteration {}: {}", done + 1, reason.message);
                return Err(reason);
            }
            done += 1;
            self.store
                .upsert(ctx.run_id(), StatusUpdate::new().iterations(done))
                .await;

            if !continues(policy, done, start.elapsed()) || control.checkpoint().await {
                break;
            }
            let pause = match remaining(policy, start.elapsed()) {
                Some(left) => wait.min(left),
                None => wait,
            };
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else if control.sleep(pause).await {
                break;
            }
            if control.checkpoint().await {
                break;
            }
        }
        debug!(iterations = done, "main loop done");

        self.hook(HookPoint::AfterMain, Phase::Main).await
    }

    async fn post(&self) -> PhaseResult {
        let ctx = self.ctx.as_ref();
        self.store
            .upsert(
                ctx.run_id(),
                StatusUpdate::new()
                    .phase(Some(Phase::Post))
                    .post_status(UnitStatus::Running),
            )
            .await;
        self.hook(HookPoint::BeforePost, Phase::Post).await?;
        guarded(self.template.case.post_test_case(ctx), FailureKind::Cleanup, Phase::Post).await?;
        self.hook(HookPoint::AfterPost, Phase::Post).await
    }

    async fn hook(&self, point: HookPoint, phase: Phase) -> PhaseResult {
        self.hooks
            .run(point, &self.ctx)
            .await
            .map_err(|e| FailureReason::new(FailureKind::Hook, Some(phase), e.to_string()))
    }

    async fn record_failure(&self, reason: FailureReason) {
        warn!(phase = ?reason.phase, kind = ?reason.kind, message = %reason.message, "unit failure");
        self.store
            .upsert(self.ctx.run_id(), StatusUpdate::new().failure(reason))
            .await;
    }
}

/// Await a test case call. An error is reported as `kind`, a panic as
/// [`FailureKind::Panicked`]; either way the lifecycle carries on.
async fn guarded<F>(call: F, kind: FailureKind, phase: Phase) -> PhaseResult
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FailureReason::new(kind, Some(phase), format!("{e:#}"))),
        Err(payload) => Err(FailureReason::new(
            FailureKind::Panicked,
            Some(phase),
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Whether the main loop runs another iteration.
fn continues(policy: LoopPolicy, done: u32, elapsed: Duration) -> bool {
    match policy {
        LoopPolicy::Bounded { duration, iterations } => done < iterations && elapsed < duration,
        LoopPolicy::Timed(duration) => elapsed < duration,
        LoopPolicy::Counted(iterations) => done < iterations,
        LoopPolicy::Once => done == 0,
    }
}

/// Time left in a time-bounded loop.
fn remaining(policy: LoopPolicy, elapsed: Duration) -> Option<Duration> {
    match policy {
        LoopPolicy::Bounded { duration, .. } | LoopPolicy::Timed(duration) => {
            Some(duration.saturating_sub(elapsed))
        }
        LoopPolicy::Counted(_) | LoopPolicy::Once => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{NullLogRouter, TestCase};
    use crate::control::WorkerControl;
    use crate::hooks::Hook;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use testrig_core::{RunId, UnitSpec};
    use testrig_dispatch::DeviceSet;

    #[derive(Default)]
    struct Counting {
        fail_pre: bool,
        fail_at: Option<u32>,
        fail_post: bool,
        panic_pre: bool,
        panic_at: Option<u32>,
        panic_post: bool,
        pre: AtomicU32,
        calls: AtomicU32,
        post: AtomicU32,
    }

    #[async_trait]
    impl TestCase for Counting {
        async fn pre_test_case(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
            self.pre.fetch_add(1, Ordering::SeqCst);
            if self.panic_pre {
                panic!("interface table corrupt");
            }
            if self.fail_pre {
                anyhow::bail!("link down");
            }
            Ok(())
        }

        async fn procedure(&self, ctx: &UnitContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_at == Some(ctx.iteration()) {
                panic!("counter overflow");
            }
            if self.fail_at == Some(ctx.iteration()) {
                anyhow::bail!("ping lost");
            }
            Ok(())
        }

        async fn post_test_case(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
            self.post.fetch_add(1, Ordering::SeqCst);
            if self.panic_post {
                panic!("teardown crashed");
            }
            if self.fail_post {
                anyhow::bail!("cleanup refused");
            }
            Ok(())
        }
    }

    struct Harness {
        case: Arc<Counting>,
        store: Arc<StatusStore>,
        control: Arc<WorkerControl>,
        worker: Worker,
    }

    fn harness(spec: UnitSpec, case: Counting, hooks: HookRunner) -> Harness {
        let case = Arc::new(case);
        let store = Arc::new(StatusStore::new());
        let control = Arc::new(WorkerControl::new(spec.killable));
        let run_id = RunId::first(spec.name.clone());
        let ctx = Arc::new(UnitContext::new(run_id, DeviceSet::new(), control.clone()));
        let worker = Worker {
            template: UnitTemplate::from_shared(spec, case.clone()),
            ctx,
            store: store.clone(),
            hooks: Arc::new(hooks),
            log_router: Arc::new(NullLogRouter),
        };
        Harness { case, store, control, worker }
    }

    async fn record(store: &StatusStore, name: &str) -> testrig_core::StatusRecord {
        store.get(&RunId::first(name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_pass_runs_once() {
        let h = harness(UnitSpec::new("ping"), Counting::default(), HookRunner::new());
        let status = h.worker.run().await;
        assert_eq!(status, UnitStatus::Pass);

        let r = record(&h.store, "ping").await;
        assert_eq!(r.stage, Stage::Done);
        assert_eq!(r.post_status, Some(UnitStatus::Pass));
        assert_eq!(r.iterations, 1);
        assert!(r.ended_at.is_some() && r.duration.is_some());
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.control.state(), crate::control::SuspendState::Finished);
    }

    #[tokio::test]
    async fn test_counted_loop() {
        let h = harness(UnitSpec::new("ping").with_iterations(4), Counting::default(), HookRunner::new());
        h.worker.run().await;
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_pre_failure_skips_main_runs_post() {
        let case = Counting { fail_pre: true, ..Default::default() };
        let h = harness(UnitSpec::new("bgp"), case, HookRunner::new());
        let status = h.worker.run().await;

        assert_eq!(status, UnitStatus::ConfigError);
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.case.post.load(Ordering::SeqCst), 1);
        let r = record(&h.store, "bgp").await;
        assert_eq!(r.failure_reasons.len(), 1);
        assert_eq!(r.failure_reasons[0].kind, FailureKind::Precondition);
    }

    #[tokio::test]
    async fn test_procedure_failure_stops_loop() {
        let case = Counting { fail_at: Some(2), ..Default::default() };
        let h = harness(UnitSpec::new("ping").with_iterations(5), case, HookRunner::new());
        let status = h.worker.run().await;

        assert_eq!(status, UnitStatus::Failed);
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.case.post.load(Ordering::SeqCst), 1);
        let r = record(&h.store, "ping").await;
        assert_eq!(r.iterations, 1);
        assert!(r.failure_reasons[0].message.contains("iteration 2"));
    }

    #[tokio::test]
    async fn test_post_failure_keeps_main_failure() {
        let case = Counting { fail_at: Some(1), fail_post: true, ..Default::default() };
        let h = harness(UnitSpec::new("ping"), case, HookRunner::new());
        let status = h.worker.run().await;

        assert_eq!(status, UnitStatus::Failed);
        let r = record(&h.store, "ping").await;
        assert_eq!(r.post_status, Some(UnitStatus::Failed));
        let kinds: Vec<_> = r.failure_reasons.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Procedure, FailureKind::Cleanup]);
    }

    #[tokio::test]
    async fn test_post_failure_alone_keeps_pass() {
        let case = Counting { fail_post: true, ..Default::default() };
        let h = harness(UnitSpec::new("ping"), case, HookRunner::new());
        assert_eq!(h.worker.run().await, UnitStatus::Pass);
        assert_eq!(record(&h.store, "ping").await.post_status, Some(UnitStatus::Failed));
    }

    #[tokio::test]
    async fn test_procedure_panic_fails_and_runs_post() {
        let case = Counting { panic_at: Some(2), ..Default::default() };
        let h = harness(UnitSpec::new("ping").with_iterations(5), case, HookRunner::new());
        let status = h.worker.run().await;

        assert_eq!(status, UnitStatus::Failed);
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.case.post.load(Ordering::SeqCst), 1);
        let r = record(&h.store, "ping").await;
        assert_eq!(r.stage, Stage::Done);
        assert_eq!(r.post_status, Some(UnitStatus::Pass));
        assert_eq!(r.failure_reasons.len(), 1);
        assert_eq!(r.failure_reasons[0].kind, FailureKind::Panicked);
        assert_eq!(r.failure_reasons[0].phase, Some(Phase::Main));
        assert_eq!(r.failure_reasons[0].message, "iteration 2: panicked: counter overflow");
        assert_eq!(h.control.state(), crate::control::SuspendState::Finished);
    }

    #[tokio::test]
    async fn test_pre_panic_is_config_error() {
        let case = Counting { panic_pre: true, ..Default::default() };
        let h = harness(UnitSpec::new("bgp"), case, HookRunner::new());
        assert_eq!(h.worker.run().await, UnitStatus::ConfigError);
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.case.post.load(Ordering::SeqCst), 1);
        let r = record(&h.store, "bgp").await;
        assert_eq!(r.failure_reasons[0].kind, FailureKind::Panicked);
        assert_eq!(r.failure_reasons[0].phase, Some(Phase::Pre));
    }

    #[tokio::test]
    async fn test_post_panic_fails_post_only() {
        let case = Counting { panic_post: true, ..Default::default() };
        let h = harness(UnitSpec::new("ping"), case, HookRunner::new());
        assert_eq!(h.worker.run().await, UnitStatus::Pass);
        let r = record(&h.store, "ping").await;
        assert_eq!(r.post_status, Some(UnitStatus::Failed));
        assert_eq!(r.failure_reasons[0].kind, FailureKind::Panicked);
        assert_eq!(r.failure_reasons[0].phase, Some(Phase::Post));
    }

    #[tokio::test]
    async fn test_duration_loop_ends_after_duration() {
        let spec = UnitSpec::new("soak")
            .with_duration(Duration::from_millis(150))
            .with_wait_between_iterations(Duration::from_millis(40));
        let h = harness(spec, Counting::default(), HookRunner::new());

        let start = Instant::now();
        h.worker.run().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert!(h.case.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_bounded_loop_stops_on_iterations() {
        let spec = UnitSpec::new("soak")
            .with_duration(Duration::from_secs(30))
            .with_iterations(3);
        let h = harness(spec, Counting::default(), HookRunner::new());
        h.worker.run().await;
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_kill_during_wait_runs_post() {
        let spec = UnitSpec::new("soak")
            .with_iterations(100)
            .with_wait_between_iterations(Duration::from_secs(30));
        let h = harness(spec, Counting::default(), HookRunner::new());
        let store = h.store.clone();
        let control = h.control.clone();
        let case = h.case.clone();
        let running = tokio::spawn(h.worker.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        control.kill();
        store.mark_killed(&RunId::first("soak"), "operator").await;

        let status = tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert_eq!(status, UnitStatus::Killed);
        assert_eq!(case.calls.load(Ordering::SeqCst), 1);
        assert_eq!(case.post.load(Ordering::SeqCst), 1);
        let r = store.get(&RunId::first("soak")).await.unwrap();
        assert_eq!(r.post_status, Some(UnitStatus::Pass));
        assert_eq!(r.stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_hook_failure_is_classified() {
        struct Refuse;

        #[async_trait]
        impl Hook for Refuse {
            fn name(&self) -> &str {
                "refuse"
            }
            async fn run(&self, _point: HookPoint, _ctx: &UnitContext) -> anyhow::Result<()> {
                anyhow::bail!("no")
            }
        }

        let hooks = HookRunner::new().with_hook(HookPoint::BeforeMain, Arc::new(Refuse));
        let h = harness(UnitSpec::new("ping"), Counting::default(), hooks);
        assert_eq!(h.worker.run().await, UnitStatus::Failed);
        assert_eq!(h.case.calls.load(Ordering::SeqCst), 0);
        let r = record(&h.store, "ping").await;
        assert_eq!(r.failure_reasons[0].kind, FailureKind::Hook);
        assert_eq!(r.failure_reasons[0].phase, Some(Phase::Main));
    }

    #[test]
    fn test_continues() {
        assert!(continues(LoopPolicy::Once, 0, Duration::ZERO));
        assert!(!continues(LoopPolicy::Once, 1, Duration::ZERO));
        assert!(!continues(LoopPolicy::Counted(2), 2, Duration::ZERO));
        assert!(!continues(LoopPolicy::Timed(Duration::from_secs(1)), 0, Duration::from_secs(2)));
        assert!(!continues(
            LoopPolicy::Bounded { duration: Duration::from_secs(10), iterations: 1 },
            1,
            Duration::ZERO
        ));
    }
}
