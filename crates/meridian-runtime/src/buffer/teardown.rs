use meridian_device::{DeviceAllocator, DeviceOrdinal, DeviceRegion, MemorySpace};

/// Regions the engine allocated during one execution
///
/// Everything still held when the guard drops is returned to the
/// allocator, so temporaries are released on success and failure alike.
/// Regions handed to the caller are removed with [`OwnedAllocations::take`].
pub struct OwnedAllocations<'a> {
    allocator: &'a dyn DeviceAllocator,
    device: DeviceOrdinal,
    regions: Vec<DeviceRegion>,
}

impl<'a> OwnedAllocations<'a> {
    pub fn new(allocator: &'a dyn DeviceAllocator, device: DeviceOrdinal) -> Self {
        Self {
            allocator,
            device,
            regions: Vec::new(),
        }
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    /// Allocate through the guard so the region is released with it.
    pub fn allocate(&mut self, size: usize, color: MemorySpace) -> meridian_device::Result<DeviceRegion> {
        let region = self.allocator.allocate(self.device, size, true, color)?;
        if !region.is_null() {
            self.regions.push(region);
        }
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total bytes currently held
    pub fn bytes(&self) -> usize {
        self.regions.iter().map(DeviceRegion::size).sum()
    }

    /// Stop tracking the region at `address`; returns whether it was held.
    pub fn take(&mut self, address: u64) -> bool {
        match self.regions.iter().position(|r| r.address() == address) {
            Some(position) => {
                self.regions.swap_remove(position);
                true
            }
            None => false,
        }
    }
}

impl Drop for OwnedAllocations<'_> {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            if let Err(err) = self.allocator.deallocate(self.device, region) {
                tracing::warn!(device = %self.device, %region, error = %err, "failed to release execution buffer");
            }
        }
    }
}
