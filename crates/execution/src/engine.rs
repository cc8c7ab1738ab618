//! The execution engine: admission, supervision and stop-on-error.
//!
//! ```text
//! admit (dependencies, slots) → worker: pre → main loop → post → commit
//!                    ↑                                              │
//!                    └──────── supervise (timeouts, kills) ◄────────┘
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use testrig_core::{
    FailureKind, FailureReason, RunId, RunSummary, Stage, StatusRecord, StatusUpdate, UnitSpec, UnitStatus,
};
use testrig_dispatch::DeviceSet;
use testrig_storage::StatusStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::case::{LogRouter, NullLogRouter, UnitContext, UnitTemplate};
use crate::config::{EngineConfig, ExecutionMode};
use crate::control::WorkerControl;
use crate::dependency::{DependencyResolver, Resolution};
use crate::error::{ExecutionError, Result};
use crate::hooks::HookRunner;
use crate::scheduler::WorkerPool;
use crate::worker::{panic_message, Worker};

/// Consecutive idle polls after which a dependency wait is declared stuck.
const STALLED_POLLS: u32 = 3;

/// State shared by the engine, its workers and every [`EngineHandle`].
struct Shared {
    store: Arc<StatusStore>,
    pool: WorkerPool,
    running: AtomicBool,
    stopping: AtomicBool,
    stop_cause: Mutex<Option<RunId>>,
    wake: Notify,
}

/// What a kill request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillOutcome {
    Killed,
    Deferred,
    NotRunning,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn request_stop(&self, cause: &RunId) {
        let mut stop_cause = self.stop_cause.lock().unwrap_or_else(|p| p.into_inner());
        if stop_cause.is_none() {
            *stop_cause = Some(cause.clone());
            self.stopping.store(true, Ordering::SeqCst);
            error!(run = %cause, "stop on error triggered");
            self.wake.notify_one();
        }
    }

    fn stop_cause(&self) -> Option<RunId> {
        self.stop_cause.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn reset(&self) {
        *self.stop_cause.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Kill a tracked run, or defer the kill while it is unkillable.
    async fn kill(&self, run_id: &RunId, reason: FailureReason) -> KillOutcome {
        let Some(control) = self.pool.control(run_id) else {
            return KillOutcome::NotRunning;
        };
        if !control.is_killable() {
            // The first deferred reason is the one applied.
            if !self.pool.kill_pending(run_id) {
                info!(run = %run_id, "unit not killable yet, kill deferred");
                self.pool.defer_kill(run_id, reason);
            }
            return KillOutcome::Deferred;
        }
        let worker = self.pool.worker(run_id);
        control.kill();
        self.store.mark_killed_with(run_id, reason).await;
        self.pool.release(run_id);
        match worker {
            Some(worker) => info!(run = %run_id, %worker, "unit killed"),
            None => info!(run = %run_id, "unit killed"),
        }
        KillOutcome::Killed
    }

    async fn apply_deferred_kills(&self) {
        for (run_id, reason) in self.pool.take_ready_kills() {
            self.kill(&run_id, reason).await;
        }
    }

    async fn kill_timed_out(&self) {
        for (run_id, timeout) in self.pool.timed_out() {
            warn!(run = %run_id, ?timeout, "unit timed out");
            let reason = FailureReason::new(FailureKind::TimedOut, None, format!("timed out after {timeout:?}"));
            self.kill(&run_id, reason).await;
        }
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a Shared);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// Runs a suite of units.
pub struct ExecutionEngine {
    templates: Vec<UnitTemplate>,
    devices: DeviceSet,
    hooks: Arc<HookRunner>,
    log_router: Arc<dyn LogRouter>,
    resolver: DependencyResolver,
    config: EngineConfig,
    shared: Arc<Shared>,
}

impl ExecutionEngine {
    /// Create an engine writing to `store`.
    pub fn new(store: Arc<StatusStore>) -> Self {
        Self {
            templates: Vec::new(),
            devices: DeviceSet::new(),
            hooks: Arc::new(HookRunner::new()),
            log_router: Arc::new(NullLogRouter),
            resolver: DependencyResolver::new(),
            config: EngineConfig::default(),
            shared: Arc::new(Shared {
                store,
                pool: WorkerPool::new(None),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_cause: Mutex::new(None),
                wake: Notify::new(),
            }),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the devices units may dispatch to.
    pub fn with_devices(mut self, devices: DeviceSet) -> Self {
        self.devices = devices;
        self
    }

    /// Set the lifecycle hooks.
    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Set the log router.
    pub fn with_log_router(mut self, router: Arc<dyn LogRouter>) -> Self {
        self.log_router = router;
        self
    }

    /// Add a unit template.
    pub fn add_unit(&mut self, template: UnitTemplate) -> Result<()> {
        template.spec.validate()?;
        if self.templates.iter().any(|t| t.name() == template.name()) {
            return Err(ExecutionError::DuplicateUnit(template.name().to_string()));
        }
        self.templates.push(template);
        Ok(())
    }

    /// Builder form of [`add_unit`](Self::add_unit).
    pub fn with_unit(mut self, template: UnitTemplate) -> Result<Self> {
        self.add_unit(template)?;
        Ok(self)
    }

    /// Unit templates in admission order.
    pub fn units(&self) -> &[UnitTemplate] {
        &self.templates
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The status store.
    pub fn store(&self) -> &Arc<StatusStore> {
        &self.shared.store
    }

    /// A control handle usable while [`run`](Self::run) is in progress.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run every unit to completion.
    ///
    /// Returns the run summary, or [`ExecutionError::StopOnError`] when
    /// stop-on-error aborted the run.
    pub async fn run(&self) -> Result<RunSummary> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.shared);
        self.shared.reset();
        self.shared.pool.set_limit(self.config.max_concurrent);

        for template in &self.templates {
            self.shared
                .store
                .register(&RunId::first(template.name()), &template.spec.aliases)
                .await;
        }

        info!(
            units = self.templates.len(),
            mode = ?self.config.mode,
            stop_on_error = self.config.stop_on_error,
            "run started"
        );

        let run = Arc::new(RunContext {
            shared: self.shared.clone(),
            templates: self.templates.clone(),
            devices: self.devices.clone(),
            hooks: self.hooks.clone(),
            log_router: self.log_router.clone(),
            resolver: self.resolver,
            deadline: self.config.run_duration.map(|d| Instant::now() + d),
            config: self.config.clone(),
        });

        let mut admitters: Vec<JoinHandle<()>> = match self.config.mode {
            ExecutionMode::Serial => vec![tokio::spawn(run.clone().admit_serial())],
            ExecutionMode::Parallel => self
                .templates
                .iter()
                .map(|t| tokio::spawn(run.clone().admit_template(t.clone())))
                .collect(),
        };
        run.supervise(&mut admitters).await;

        let summary = self.shared.store.summary().await;
        if let Some(cause) = self.shared.stop_cause() {
            error!(unit = %cause, %summary, "run aborted");
            return Err(ExecutionError::StopOnError {
                unit: cause.to_string(),
                summary,
            });
        }
        info!(%summary, "run finished");
        Ok(summary)
    }
}

/// Outcome of one admission attempt.
enum Step {
    /// Admit the next run of this template
    Again,
    /// This template is finished
    Done,
    /// The run is stopping
    Stop,
}

/// Outcome of a dependency wait.
enum Admission {
    Proceed,
    Fail(String),
    Stopped,
}

/// Everything one `run` call needs, shared by its admitters.
struct RunContext {
    shared: Arc<Shared>,
    templates: Vec<UnitTemplate>,
    devices: DeviceSet,
    hooks: Arc<HookRunner>,
    log_router: Arc<dyn LogRouter>,
    resolver: DependencyResolver,
    config: EngineConfig,
    deadline: Option<Instant>,
}

impl RunContext {
    fn may_admit(&self) -> bool {
        !self.shared.is_stopping() && self.deadline.map_or(true, |d| Instant::now() < d)
    }

    /// Whether a finished run of `spec` is followed by another.
    fn repeats(&self, spec: &UnitSpec, run_number: u32) -> bool {
        spec.repeatable
            && spec.admits_run(run_number + 1)
            && (self.deadline.is_some() || spec.max_runs.is_some())
    }

    async fn pause_between_cases(&self) {
        if !self.config.wait_between_cases.is_zero() {
            tokio::time::sleep(self.config.wait_between_cases).await;
        }
    }

    fn on_failure(&self, run_id: &RunId) {
        if self.config.stop_on_error {
            self.shared.request_stop(run_id);
        }
    }

    /// Serial mode: one lifecycle at a time, passing over the list again
    /// while repeatable units have runs left.
    async fn admit_serial(self: Arc<Self>) {
        let mut next_run: Vec<u32> = vec![1; self.templates.len()];
        let mut finished: HashSet<usize> = HashSet::new();
        let mut first = true;

        loop {
            let mut admitted = false;
            for (index, template) in self.templates.iter().enumerate() {
                if finished.contains(&index) {
                    continue;
                }
                if !first {
                    self.pause_between_cases().await;
                }
                if !self.may_admit() {
                    return;
                }
                first = false;
                admitted = true;
                match self.admit_run(template, next_run[index]).await {
                    Step::Again => next_run[index] += 1,
                    Step::Done => {
                        finished.insert(index);
                    }
                    Step::Stop => return,
                }
            }
            if !admitted {
                return;
            }
        }
    }

    /// Parallel mode: one admitter per template.
    async fn admit_template(self: Arc<Self>, template: UnitTemplate) {
        let mut run_number = 1;
        while self.may_admit() {
            match self.admit_run(&template, run_number).await {
                Step::Again => {
                    run_number += 1;
                    self.pause_between_cases().await;
                }
                Step::Done | Step::Stop => return,
            }
        }
    }

    async fn admit_run(&self, template: &UnitTemplate, run_number: u32) -> Step {
        let spec = &template.spec;
        if !spec.admits_run(run_number) {
            return Step::Done;
        }
        let run_id = RunId::new(spec.name.clone(), run_number);

        match self.await_dependencies(spec, &run_id).await {
            Admission::Proceed => {}
            Admission::Stopped => return Step::Stop,
            Admission::Fail(reason) => {
                let err = ExecutionError::DependencyUnsatisfied {
                    unit: run_id.to_string(),
                    reason,
                };
                warn!(run = %run_id, error = %err, "unit not admitted");
                let update = StatusUpdate::finished(UnitStatus::ConfigError, None)
                    .aliases(spec.aliases.clone())
                    .failure(FailureReason::new(FailureKind::Dependency, None, err.to_string()));
                self.shared.store.upsert(&run_id, update).await;
                self.on_failure(&run_id);
                return Step::Done;
            }
        }
        if !self.may_admit() {
            return Step::Stop;
        }

        let Some(status) = self.launch(template, run_id.clone()).await else {
            return Step::Stop;
        };
        if status.is_failure() {
            self.on_failure(&run_id);
        }
        if status == UnitStatus::Killed || !self.repeats(spec, run_number) {
            Step::Done
        } else {
            Step::Again
        }
    }

    /// Poll the resolver until the unit may start.
    async fn await_dependencies(&self, spec: &UnitSpec, run_id: &RunId) -> Admission {
        let started = Instant::now();
        let mut stalled = 0u32;
        let mut last_generation = None;

        loop {
            if self.shared.is_stopping() {
                return Admission::Stopped;
            }
            let peers = self.shared.store.snapshot().await;
            let pending = match self.resolver.resolve(spec, &peers) {
                Resolution::Proceed => return Admission::Proceed,
                Resolution::Fail(reason) => return Admission::Fail(reason),
                Resolution::Wait { pending } => pending,
            };

            if let Some(limit) = self.config.dependency_timeout {
                if started.elapsed() >= limit {
                    return Admission::Fail(format!(
                        "timed out after {:?} waiting for {}",
                        limit,
                        pending.join(", ")
                    ));
                }
            }

            let generation = self.shared.pool.generation();
            if self.shared.pool.is_idle() && last_generation == Some(generation) {
                stalled += 1;
                if stalled >= STALLED_POLLS {
                    return Admission::Fail(format!(
                        "no running unit can bring {} to the required status",
                        pending.join(", ")
                    ));
                }
            } else {
                stalled = 0;
            }
            last_generation = Some(generation);

            debug!(run = %run_id, ?pending, "waiting for dependencies");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Start a worker for `run_id` and wait until the scheduler stops
    /// tracking it. Returns the run's status at that point.
    async fn launch(&self, template: &UnitTemplate, run_id: RunId) -> Option<UnitStatus> {
        let pool = &self.shared.pool;
        let reservation = pool.reserve().await;
        if self.shared.is_stopping() {
            pool.cancel(reservation);
            return None;
        }

        let control = Arc::new(WorkerControl::new(template.spec.killable));
        let ctx = Arc::new(UnitContext::new(run_id.clone(), self.devices.clone(), control.clone()));
        self.shared
            .store
            .upsert(
                &run_id,
                StatusUpdate::new()
                    .stage(Stage::Admitted)
                    .status(UnitStatus::Admitted)
                    .worker(ctx.worker())
                    .aliases(template.spec.aliases.clone()),
            )
            .await;
        pool.insert(run_id.clone(), reservation, control.clone(), ctx.worker(), template.spec.timeout);
        debug!(run = %run_id, worker = %ctx.worker(), "unit admitted");

        let worker = Worker {
            template: template.clone(),
            ctx,
            store: self.shared.store.clone(),
            hooks: self.hooks.clone(),
            log_router: self.log_router.clone(),
        };
        let span = info_span!("unit", run = %run_id);
        let shared = self.shared.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(worker.run().instrument(span)).await {
                let message = if e.is_panic() {
                    format!("worker panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    "worker cancelled".to_string()
                };
                error!(run = %id, %message, "worker panicked");
                let update = StatusUpdate::finished(UnitStatus::Failed, None)
                    .failure(FailureReason::new(FailureKind::Panicked, None, message));
                shared.store.upsert(&id, update).await;
            }
            control.finish();
            shared.pool.release(&id);
        });

        pool.wait_released(&run_id).await;
        self.shared.store.status(&run_id).await
    }

    /// Control loop: hang detection, deferred kills and stop-on-error.
    async fn supervise(&self, admitters: &mut Vec<JoinHandle<()>>) {
        loop {
            self.shared.kill_timed_out().await;
            self.shared.apply_deferred_kills().await;

            if self.shared.is_stopping() {
                self.stop_all(admitters).await;
                return;
            }
            admitters.retain(|handle| !handle.is_finished());
            if admitters.is_empty() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shared.wake.notified() => {}
            }
        }
    }

    /// Kill everything, give unkillable units the grace period, then detach
    /// whatever is left.
    async fn stop_all(&self, admitters: &mut Vec<JoinHandle<()>>) {
        let cause = self
            .shared
            .stop_cause()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let pool = &self.shared.pool;

        for run_id in pool.running() {
            let reason = FailureReason::new(FailureKind::Killed, None, format!("stop on error: {cause} failed"));
            self.shared.kill(&run_id, reason).await;
        }

        let grace_end = Instant::now() + self.config.stop_grace;
        while !pool.is_empty() && Instant::now() < grace_end {
            self.shared.apply_deferred_kills().await;
            let left = grace_end.saturating_duration_since(Instant::now());
            pool.wait_empty(self.config.poll_interval.min(left)).await;
        }

        for run_id in pool.running() {
            warn!(run = %run_id, "unit still running after grace period, detaching");
            if let Some(control) = pool.control(&run_id) {
                control.kill();
            }
            let update = StatusUpdate::finished(UnitStatus::Incomplete, None).failure(FailureReason::new(
                FailureKind::Aborted,
                None,
                format!("still running {:?} after stop on error", self.config.stop_grace),
            ));
            self.shared
                .store
                .upsert_if(&run_id, |record| !record.is_terminal(), update)
                .await;
            pool.release(&run_id);
        }

        for handle in admitters.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "admitter ended abnormally");
            }
        }
    }
}

/// Control handle for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    fn tracked(&self, unit: &str) -> Result<Vec<RunId>> {
        let runs = self.shared.pool.find(unit);
        if runs.is_empty() {
            Err(ExecutionError::NotRunning(unit.to_string()))
        } else {
            Ok(runs)
        }
    }

    /// Suspend a unit (template name or `name#n`), waiting until it parks.
    pub async fn suspend(&self, unit: &str) -> Result<()> {
        for run_id in self.tracked(unit)? {
            if let Some(control) = self.shared.pool.control(&run_id) {
                control.suspend().await;
                info!(run = %run_id, "unit suspended");
            }
        }
        Ok(())
    }

    /// Resume a suspended unit.
    pub fn resume(&self, unit: &str) -> Result<()> {
        for run_id in self.tracked(unit)? {
            if let Some(control) = self.shared.pool.control(&run_id) {
                control.resume();
                info!(run = %run_id, "unit resumed");
            }
        }
        Ok(())
    }

    /// Kill a unit. Unkillable units are killed once they allow it.
    pub async fn kill(&self, unit: &str) -> Result<()> {
        for run_id in self.tracked(unit)? {
            let reason = FailureReason::new(FailureKind::Killed, None, "killed on request");
            if self.shared.kill(&run_id, reason).await == KillOutcome::NotRunning {
                return Err(ExecutionError::NotRunning(run_id.to_string()));
            }
        }
        Ok(())
    }

    /// Record of a run (`name#n`) or of the latest run of a template.
    pub async fn record(&self, unit: &str) -> Option<StatusRecord> {
        if let Ok(run_id) = unit.parse::<RunId>() {
            if let Some(record) = self.shared.store.get(&run_id).await {
                return Some(record);
            }
        }
        self.shared
            .store
            .latest_runs()
            .await
            .into_iter()
            .find(|r| r.template() == unit)
    }

    /// Status of a run or of the latest run of a template.
    pub async fn status(&self, unit: &str) -> Option<UnitStatus> {
        self.record(unit).await.map(|r| r.status)
    }

    /// Every record.
    pub async fn snapshot(&self) -> Vec<StatusRecord> {
        self.shared.store.snapshot().await
    }

    /// Counts per status.
    pub async fn summary(&self) -> RunSummary {
        self.shared.store.summary().await
    }

    /// Runs currently tracked.
    pub fn running(&self) -> Vec<RunId> {
        self.shared.pool.running()
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}
