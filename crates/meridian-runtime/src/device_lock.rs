//! Per-device access locks
//!
//! Executions hold their device's lock in shared mode by default. Runs that
//! request exclusive access take it in write mode and so wait for, and
//! block, every other execution on that device. Acquiring the same
//! device's lock twice from one thread is not supported.

use meridian_device::DeviceOrdinal;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceOrdinal, Arc<RwLock<()>>>>,
}

/// Held for the duration of one execution
pub enum DeviceAccessGuard {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl DeviceAccessGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, DeviceAccessGuard::Exclusive(_))
    }
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, device: DeviceOrdinal) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.lock().entry(device).or_default())
    }

    pub fn acquire(&self, device: DeviceOrdinal, exclusive: bool) -> DeviceAccessGuard {
        let lock = self.lock_for(device);
        if exclusive {
            DeviceAccessGuard::Exclusive(lock.write_arc())
        } else {
            DeviceAccessGuard::Shared(lock.read_arc())
        }
    }

    /// Non-blocking variant of [`DeviceLocks::acquire`]
    pub fn try_acquire(&self, device: DeviceOrdinal, exclusive: bool) -> Option<DeviceAccessGuard> {
        let lock = self.lock_for(device);
        if exclusive {
            lock.try_write_arc().map(DeviceAccessGuard::Exclusive)
        } else {
            lock.try_read_arc().map(DeviceAccessGuard::Shared)
        }
    }
}
