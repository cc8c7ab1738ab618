//! Active worker tracking and concurrency slots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use testrig_core::{FailureReason, RunId, WorkerId};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::control::WorkerControl;

/// A tracked worker.
#[derive(Debug)]
struct ActiveWorker {
    control: Arc<WorkerControl>,
    worker: WorkerId,
    started: Instant,
    timeout: Option<Duration>,
    pending_kill: Option<FailureReason>,
    _slot: Option<OwnedSemaphorePermit>,
}

/// A reserved admission slot, turned into a tracked worker by
/// [`WorkerPool::insert`] or given back by [`WorkerPool::cancel`].
#[derive(Debug)]
pub struct Reservation {
    slot: Option<OwnedSemaphorePermit>,
}

/// The set of workers the scheduler is tracking.
///
/// Detaching a worker (kill, completion) frees its slot at once, even if the
/// task behind it is still running its cleanup.
#[derive(Debug, Default)]
pub struct WorkerPool {
    slots: Mutex<Option<Arc<Semaphore>>>,
    active: Mutex<HashMap<RunId, ActiveWorker>>,
    starting: AtomicUsize,
    generation: AtomicU64,
    released: Notify,
}

impl WorkerPool {
    /// Create a pool with an optional cap on tracked workers.
    pub fn new(max_concurrent: Option<usize>) -> Self {
        let pool = Self::default();
        pool.set_limit(max_concurrent);
        pool
    }

    /// Change the cap for subsequent reservations.
    pub fn set_limit(&self, max_concurrent: Option<usize>) {
        *lock(&self.slots) = max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
    }

    /// Reserve a slot, waiting while the cap is reached.
    pub async fn reserve(&self) -> Reservation {
        self.starting.fetch_add(1, Ordering::SeqCst);
        let semaphore = lock(&self.slots).clone();
        let slot = match semaphore {
            Some(semaphore) => semaphore.acquire_owned().await.ok(),
            None => None,
        };
        Reservation { slot }
    }

    /// Give back a reservation that will not be used.
    pub fn cancel(&self, reservation: Reservation) {
        drop(reservation);
        self.starting.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Start tracking a worker.
    pub fn insert(
        &self,
        run_id: RunId,
        reservation: Reservation,
        control: Arc<WorkerControl>,
        worker: WorkerId,
        timeout: Option<Duration>,
    ) {
        lock(&self.active).insert(
            run_id,
            ActiveWorker {
                control,
                worker,
                started: Instant::now(),
                timeout,
                pending_kill: None,
                _slot: reservation.slot,
            },
        );
        self.starting.fetch_sub(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stop tracking a worker. Returns whether it was tracked.
    pub fn release(&self, run_id: &RunId) -> bool {
        let removed = lock(&self.active).remove(run_id).is_some();
        if removed {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.released.notify_waiters();
        }
        removed
    }

    /// Control block of a tracked worker.
    pub fn control(&self, run_id: &RunId) -> Option<Arc<WorkerControl>> {
        lock(&self.active).get(run_id).map(|w| w.control.clone())
    }

    /// Worker identity of a tracked run.
    pub fn worker(&self, run_id: &RunId) -> Option<WorkerId> {
        lock(&self.active).get(run_id).map(|w| w.worker)
    }

    /// Whether a run is tracked.
    pub fn contains(&self, run_id: &RunId) -> bool {
        lock(&self.active).contains_key(run_id)
    }

    /// Tracked runs of a template, or the run itself for a `name#n` key.
    pub fn find(&self, unit: &str) -> Vec<RunId> {
        let active = lock(&self.active);
        let mut found: Vec<_> = match unit.parse::<RunId>() {
            Ok(run_id) if active.contains_key(&run_id) => vec![run_id],
            _ => active.keys().filter(|id| id.template == unit).cloned().collect(),
        };
        found.sort();
        found
    }

    /// Every tracked run, sorted.
    pub fn running(&self) -> Vec<RunId> {
        let mut runs: Vec<_> = lock(&self.active).keys().cloned().collect();
        runs.sort();
        runs
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        lock(&self.active).is_empty()
    }

    /// No tracked worker and no reservation in flight.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.starting.load(Ordering::SeqCst) == 0
    }

    /// Bumped whenever a worker is inserted or released.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Remember a kill to perform once the worker becomes killable.
    pub fn defer_kill(&self, run_id: &RunId, reason: FailureReason) {
        if let Some(worker) = lock(&self.active).get_mut(run_id) {
            worker.pending_kill.get_or_insert(reason);
        }
    }

    /// Whether a kill is waiting on this run.
    pub fn kill_pending(&self, run_id: &RunId) -> bool {
        lock(&self.active)
            .get(run_id)
            .map(|w| w.pending_kill.is_some())
            .unwrap_or(false)
    }

    /// Deferred kills whose worker has become killable.
    pub fn take_ready_kills(&self) -> Vec<(RunId, FailureReason)> {
        let mut active = lock(&self.active);
        active
            .iter_mut()
            .filter(|(_, w)| w.pending_kill.is_some() && w.control.is_killable())
            .filter_map(|(id, w)| w.pending_kill.take().map(|reason| (id.clone(), reason)))
            .collect()
    }

    /// Runs past their timeout with no kill pending yet.
    pub fn timed_out(&self) -> Vec<(RunId, Duration)> {
        lock(&self.active)
            .iter()
            .filter(|(_, w)| w.pending_kill.is_none() && !w.control.is_killed())
            .filter_map(|(id, w)| match w.timeout {
                Some(timeout) if w.started.elapsed() > timeout => Some((id.clone(), timeout)),
                _ => None,
            })
            .collect()
    }

    /// Wait until `run_id` is no longer tracked.
    pub async fn wait_released(&self, run_id: &RunId) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.contains(run_id) {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for the pool to become empty. Returns whether it did.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
