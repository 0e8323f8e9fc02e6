//! Exclusive device leases.
//!
//! A physical device is a mutually exclusive resource for the whole fleet run:
//! at most one validation run may issue commands to a machine at any instant,
//! even when the matrix lists that machine more than once (e.g. once per
//! channel). Leases are keyed by machine identity and released on drop.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::errors::{DvhError, Result};
use crate::runner::cancel::CancelToken;

/// How often a blocked acquirer re-checks for cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct DeviceSlot {
    busy: Mutex<bool>,
    released: Condvar,
    holders: AtomicUsize,
    peak_holders: AtomicUsize,
}

/// Registry of per-machine leases shared by all fleet workers.
#[derive(Debug, Default)]
pub struct DeviceLockRegistry {
    slots: Mutex<HashMap<String, Arc<DeviceSlot>>>,
}

impl DeviceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, machine: &str) -> Arc<DeviceSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(machine.to_string()).or_default())
    }

    /// Block until `machine` is free, then hold it until the lease drops.
    ///
    /// Fails with [`DvhError::Interrupted`] if `cancel` trips while waiting.
    pub fn acquire(&self, machine: &str, cancel: &CancelToken) -> Result<DeviceLease> {
        let slot = self.slot(machine);
        {
            let mut busy = slot.busy.lock();
            while *busy {
                if cancel.is_cancelled() {
                    return Err(DvhError::Interrupted {
                        command: format!("waiting for device lease on {machine}"),
                    });
                }
                let _ = slot.released.wait_for(&mut busy, WAIT_SLICE);
            }
            *busy = true;
        }

        let holders = slot.holders.fetch_add(1, Ordering::SeqCst) + 1;
        slot.peak_holders.fetch_max(holders, Ordering::SeqCst);

        Ok(DeviceLease {
            machine: machine.to_string(),
            slot,
        })
    }

    /// Try to take the lease without blocking.
    pub fn try_acquire(&self, machine: &str) -> Option<DeviceLease> {
        let slot = self.slot(machine);
        {
            let mut busy = slot.busy.lock();
            if *busy {
                return None;
            }
            *busy = true;
        }
        let holders = slot.holders.fetch_add(1, Ordering::SeqCst) + 1;
        slot.peak_holders.fetch_max(holders, Ordering::SeqCst);
        Some(DeviceLease {
            machine: machine.to_string(),
            slot,
        })
    }

    /// Current number of lease holders for `machine` (0 or 1).
    pub fn holders(&self, machine: &str) -> usize {
        self.slots
            .lock()
            .get(machine)
            .map_or(0, |slot| slot.holders.load(Ordering::SeqCst))
    }

    /// Highest number of simultaneous holders ever observed for `machine`.
    pub fn peak_holders(&self, machine: &str) -> usize {
        self.slots
            .lock()
            .get(machine)
            .map_or(0, |slot| slot.peak_holders.load(Ordering::SeqCst))
    }
}

/// Exclusive ownership of one machine. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    machine: String,
    slot: Arc<DeviceSlot>,
}

impl DeviceLease {
    pub fn machine(&self) -> &str {
        &self.machine
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.slot.holders.fetch_sub(1, Ordering::SeqCst);
        *self.slot.busy.lock() = false;
        self.slot.released.notify_one();
    }
}
