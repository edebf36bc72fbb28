//! Allocator over host memory with optional capacity limit

use super::HostDevice;
use crate::error::{DeviceError, Result};
use crate::traits::DeviceAllocator;
use crate::types::{DeviceOrdinal, DeviceRegion, MemorySpace};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct AllocatorState {
    /// Address -> size of every allocation made through this allocator
    live: HashMap<u64, usize>,
    bytes_in_use: usize,
    allocations: u64,
    deallocations: u64,
}

/// [`DeviceAllocator`] over a [`HostDevice`]
///
/// Allocations beyond the configured capacity fail with
/// [`DeviceError::OutOfMemory`], which lets tests drive exhaustion paths.
pub struct HostAllocator {
    device: HostDevice,
    capacity: Option<usize>,
    asynchronous_deallocation: bool,
    state: Mutex<AllocatorState>,
}

impl HostAllocator {
    pub fn new(device: HostDevice) -> Self {
        Self {
            device,
            capacity: None,
            asynchronous_deallocation: false,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Limit the total bytes live at once.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_asynchronous_deallocation(mut self, enabled: bool) -> Self {
        self.asynchronous_deallocation = enabled;
        self
    }

    pub fn device(&self) -> &HostDevice {
        &self.device
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().bytes_in_use
    }

    pub fn allocation_count(&self) -> u64 {
        self.state.lock().allocations
    }

    pub fn deallocation_count(&self) -> u64 {
        self.state.lock().deallocations
    }

    /// Whether `address` is a live allocation made through this allocator
    pub fn owns(&self, address: u64) -> bool {
        self.state.lock().live.contains_key(&address)
    }
}

impl DeviceAllocator for HostAllocator {
    fn allocate(
        &self,
        device: DeviceOrdinal,
        size: usize,
        _retry_on_failure: bool,
        memory_space: MemorySpace,
    ) -> Result<DeviceRegion> {
        if device.0 >= self.device.device_count() {
            return Err(DeviceError::UnknownDevice(device.to_string()));
        }
        if size == 0 {
            return Ok(DeviceRegion::empty());
        }

        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            if state.bytes_in_use + size > capacity {
                return Err(DeviceError::OutOfMemory {
                    device: device.to_string(),
                    requested: size,
                    memory_space: memory_space.0,
                });
            }
        }

        let region = self.device.allocate_raw(size);
        state.live.insert(region.address(), size);
        state.bytes_in_use += size;
        state.allocations += 1;
        tracing::trace!(%device, address = region.address(), size, "host allocation");
        Ok(region)
    }

    fn deallocate(&self, _device: DeviceOrdinal, region: DeviceRegion) -> Result<()> {
        if region.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let size = state
            .live
            .remove(&region.address())
            .ok_or(DeviceError::InvalidAddress(region.address()))?;
        state.bytes_in_use -= size;
        state.deallocations += 1;
        drop(state);
        self.device.free_raw(region.address())?;
        Ok(())
    }

    fn allows_asynchronous_deallocation(&self) -> bool {
        self.asynchronous_deallocation
    }
}
