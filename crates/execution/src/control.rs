//! Per-worker kill and suspend control.
//!
//! The scheduler never interrupts a worker. It raises flags here and the
//! worker honours them at its checkpoints: phase boundaries, inter-iteration
//! waits and the delay before start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// Suspension state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    /// Running normally
    Running,
    /// Suspension requested, worker not parked yet
    Requested,
    /// Parked at a checkpoint
    Parked,
    /// Worker finished
    Finished,
}

/// Flags shared between a worker and the scheduler.
#[derive(Debug)]
pub struct WorkerControl {
    killed: watch::Sender<bool>,
    killable: AtomicBool,
    suspend: watch::Sender<SuspendState>,
}

impl WorkerControl {
    /// Create a control block.
    pub fn new(killable: bool) -> Self {
        let (killed, _) = watch::channel(false);
        let (suspend, _) = watch::channel(SuspendState::Running);
        Self {
            killed,
            killable: AtomicBool::new(killable),
            suspend,
        }
    }

    /// Request the worker to stop at its next checkpoint.
    ///
    /// A parked worker is released so it can run its cleanup.
    pub fn kill(&self) {
        self.killed.send_replace(true);
        self.suspend.send_if_modified(|state| match state {
            SuspendState::Requested | SuspendState::Parked => {
                *state = SuspendState::Running;
                true
            }
            _ => false,
        });
    }

    /// Whether a kill was requested.
    pub fn is_killed(&self) -> bool {
        *self.killed.borrow()
    }

    /// Whether the scheduler may kill the worker right now.
    pub fn is_killable(&self) -> bool {
        self.killable.load(Ordering::SeqCst)
    }

    /// Change killability.
    pub fn set_killable(&self, killable: bool) {
        self.killable.store(killable, Ordering::SeqCst);
    }

    /// Current suspension state.
    pub fn state(&self) -> SuspendState {
        *self.suspend.borrow()
    }

    /// Request suspension and wait until the worker parks, finishes, or is
    /// killed.
    pub async fn suspend(&self) {
        self.suspend.send_if_modified(|state| {
            if *state == SuspendState::Running {
                *state = SuspendState::Requested;
                true
            } else {
                false
            }
        });

        let mut rx = self.suspend.subscribe();
        let _ = rx
            .wait_for(|state| {
                matches!(state, SuspendState::Parked | SuspendState::Finished) || self.is_killed()
            })
            .await;
    }

    /// Release a suspended worker.
    pub fn resume(&self) {
        self.suspend.send_if_modified(|state| match state {
            SuspendState::Requested | SuspendState::Parked => {
                *state = SuspendState::Running;
                true
            }
            _ => false,
        });
    }

    /// Worker side: park while suspension is requested.
    ///
    /// Returns whether the worker has been killed.
    pub async fn checkpoint(&self) -> bool {
        let parked = self.suspend.send_if_modified(|state| {
            if *state == SuspendState::Requested {
                *state = SuspendState::Parked;
                true
            } else {
                false
            }
        });
        if parked {
            let mut rx = self.suspend.subscribe();
            let _ = rx.wait_for(|state| *state != SuspendState::Parked).await;
        }
        self.is_killed()
    }

    /// Worker side: sleep, waking early on kill.
    ///
    /// Returns whether the worker has been killed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_killed();
        }
        let mut killed = self.killed.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = killed.wait_for(|k| *k) => {}
        }
        self.is_killed()
    }

    /// Worker side: mark the worker finished, releasing pending suspenders.
    pub fn finish(&self) {
        self.suspend.send_replace(SuspendState::Finished);
    }
}
