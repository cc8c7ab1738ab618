//! Test case behaviour and the per-run context handed to it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use testrig_core::{ChainId, RunId, UnitSpec, WorkerId};
use testrig_dispatch::{CommandDispatcher, CommandOutput, CommandRequest, DeviceSet, DispatchError};

use crate::control::WorkerControl;

/// Behaviour of a unit. Errors are classified by the phase that raised them.
#[async_trait]
pub trait TestCase: Send + Sync {
    /// Bring the system into the state the procedure needs.
    async fn pre_test_case(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// One iteration of the test.
    async fn procedure(&self, ctx: &UnitContext) -> anyhow::Result<()>;

    /// Undo what pre and main left behind. Always attempted once the unit ran.
    async fn post_test_case(&self, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An immutable unit template shared by every run cloned from it.
#[derive(Clone)]
pub struct UnitTemplate {
    /// Scheduling data
    pub spec: Arc<UnitSpec>,
    /// Behaviour
    pub case: Arc<dyn TestCase>,
}

impl UnitTemplate {
    /// Create a template.
    pub fn new(spec: UnitSpec, case: impl TestCase + 'static) -> Self {
        Self {
            spec: Arc::new(spec),
            case: Arc::new(case),
        }
    }

    /// Create a template from a shared test case.
    pub fn from_shared(spec: UnitSpec, case: Arc<dyn TestCase>) -> Self {
        Self {
            spec: Arc::new(spec),
            case,
        }
    }

    /// Template name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

impl std::fmt::Debug for UnitTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitTemplate").field("spec", &self.spec).finish()
    }
}

/// What a running unit sees of the scheduler.
pub struct UnitContext {
    run_id: RunId,
    worker: WorkerId,
    chain: ChainId,
    devices: DeviceSet,
    control: Arc<WorkerControl>,
    iteration: AtomicU32,
}

impl UnitContext {
    pub(crate) fn new(run_id: RunId, devices: DeviceSet, control: Arc<WorkerControl>) -> Self {
        Self {
            run_id,
            worker: WorkerId::new(),
            chain: ChainId::new(),
            devices,
            control,
            iteration: AtomicU32::new(0),
        }
    }

    /// Run identity.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Worker identity.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Operation chain used for device locking.
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Current main-loop iteration, starting at 1.
    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub(crate) fn set_iteration(&self, iteration: u32) {
        self.iteration.store(iteration, Ordering::SeqCst);
    }

    /// Dispatcher of a configured device.
    pub fn device(&self, name: &str) -> Result<Arc<CommandDispatcher>, DispatchError> {
        self.devices.get(name)
    }

    /// Dispatch an operation on this run's chain.
    pub async fn dispatch(&self, device: &str, request: CommandRequest) -> Result<CommandOutput, DispatchError> {
        self.devices.get(device)?.dispatch(self.chain, request).await
    }

    /// Allow or forbid the scheduler to kill this run right away.
    pub fn set_killable(&self, killable: bool) {
        self.control.set_killable(killable);
    }

    /// Whether a kill was requested. Long procedures may poll this.
    pub fn is_killed(&self) -> bool {
        self.control.is_killed()
    }

    pub(crate) fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }
}

/// Switches the active log stream when a unit starts.
pub trait LogRouter: Send + Sync {
    /// Route subsequent unit logging to `run_id`'s stream; returns the
    /// reference stored on the status record.
    fn switch_to(&self, run_id: &RunId) -> Option<String>;
}

/// Leaves logging where it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogRouter;

impl LogRouter for NullLogRouter {
    fn switch_to(&self, _run_id: &RunId) -> Option<String> {
        None
    }
}
