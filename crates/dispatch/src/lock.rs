//! Per-device command locks.
//!
//! Every command sent to a device holds that device's lock for the duration
//! of the call. Locks are re-entrant for the operation chain that holds them,
//! so a high-level action issuing nested device-locked sub-operations does not
//! deadlock on itself. A device can be paused: new acquisitions block, except
//! for chains already holding some device lock, while in-flight commands run
//! to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use testrig_core::ChainId;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct DeviceState {
    owner: Option<ChainId>,
    depth: usize,
    paused: bool,
}

#[derive(Debug, Default)]
struct LockState {
    devices: HashMap<String, DeviceState>,
    /// Locks held per chain across all devices
    held: HashMap<ChainId, usize>,
}

/// Lock table shared by every dispatcher of one scheduler context.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    state: Mutex<LockState>,
    changed: Notify,
}

impl DeviceLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire `device` for `chain`, waiting while another chain holds it or
    /// while the device is paused.
    pub async fn acquire(self: &Arc<Self>, device: &str, chain: ChainId) -> DeviceLockGuard {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(device, chain) {
                trace!(device, %chain, "device lock acquired");
                return DeviceLockGuard {
                    locks: self.clone(),
                    device: device.to_string(),
                    chain,
                };
            }
            notified.await;
        }
    }

    fn try_acquire(&self, device: &str, chain: ChainId) -> bool {
        let mut state = self.state();
        let holds_related = state.held.get(&chain).copied().unwrap_or(0) > 0;
        let entry = state.devices.entry(device.to_string()).or_default();

        let granted = match entry.owner {
            Some(owner) if owner == chain => true,
            Some(_) => false,
            None => !entry.paused || holds_related,
        };
        if granted {
            entry.owner = Some(chain);
            entry.depth += 1;
            *state.held.entry(chain).or_insert(0) += 1;
        }
        granted
    }

    fn release(&self, device: &str, chain: ChainId) {
        {
            let mut state = self.state();
            if let Some(entry) = state.devices.get_mut(device) {
                if entry.owner == Some(chain) {
                    entry.depth = entry.depth.saturating_sub(1);
                    if entry.depth == 0 {
                        entry.owner = None;
                    }
                }
            }
            if let Some(count) = state.held.get_mut(&chain) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.held.remove(&chain);
                }
            }
        }
        trace!(device, %chain, "device lock released");
        self.changed.notify_waiters();
    }

    /// Block new lock acquisitions on `device`.
    pub fn pause(&self, device: &str) {
        self.state().devices.entry(device.to_string()).or_default().paused = true;
        debug!(device, "device paused for new locks");
    }

    /// Allow new lock acquisitions on `device` again.
    pub fn unpause(&self, device: &str) {
        if let Some(entry) = self.state().devices.get_mut(device) {
            entry.paused = false;
        }
        debug!(device, "device accepting new locks");
        self.changed.notify_waiters();
    }

    /// Whether `device` is paused.
    pub fn is_paused(&self, device: &str) -> bool {
        self.state().devices.get(device).map(|d| d.paused).unwrap_or(false)
    }

    /// Chain currently holding `device`.
    pub fn holder(&self, device: &str) -> Option<ChainId> {
        self.state().devices.get(device).and_then(|d| d.owner)
    }

    /// Wait until no command holds `device`.
    pub async fn drain(&self, device: &str) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.holder(device).is_none() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds a device lock; released on drop.
#[derive(Debug)]
pub struct DeviceLockGuard {
    locks: Arc<DeviceLocks>,
    device: String,
    chain: ChainId,
}

impl DeviceLockGuard {
    /// Locked device.
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.device, self.chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reentrant_for_same_chain() {
        let locks = Arc::new(DeviceLocks::new());
        let chain = ChainId::new();

        let outer = locks.acquire("dut1", chain).await;
        let inner = tokio::time::timeout(Duration::from_millis(100), locks.acquire("dut1", chain))
            .await
            .expect("re-entrant acquisition must not block");
        drop(inner);
        assert_eq!(locks.holder("dut1"), Some(chain));
        drop(outer);
        assert_eq!(locks.holder("dut1"), None);
    }

    #[tokio::test]
    async fn test_other_chain_waits() {
        let locks = Arc::new(DeviceLocks::new());
        let guard = locks.acquire("dut1", ChainId::new()).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("dut1", ChainId::new())).await;
        assert!(blocked.is_err());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("dut1", ChainId::new()).await;
            })
        };
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_devices_are_independent() {
        let locks = Arc::new(DeviceLocks::new());
        let _a = locks.acquire("dut1", ChainId::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("dut2", ChainId::new())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_pause_blocks_new_chains_only() {
        let locks = Arc::new(DeviceLocks::new());
        let chain = ChainId::new();
        let _held = locks.acquire("dut2", chain).await;

        locks.pause("dut1");
        assert!(locks.is_paused("dut1"));

        let stranger = tokio::time::timeout(Duration::from_millis(50), locks.acquire("dut1", ChainId::new())).await;
        assert!(stranger.is_err());

        // A chain holding a related lock is let through.
        let related = tokio::time::timeout(Duration::from_millis(100), locks.acquire("dut1", chain)).await;
        assert!(related.is_ok());
        drop(related);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("dut1", ChainId::new()).await;
            })
        };
        locks.unpause("dut1");
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let locks = Arc::new(DeviceLocks::new());
        let guard = locks.acquire("dut1", ChainId::new()).await;
        locks.pause("dut1");

        let drained = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.drain("dut1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), drained).await.unwrap().unwrap();
    }
}
