//! Address-space emulation for the host backend
//!
//! Every allocation gets a synthetic device address aligned to
//! [`HOST_ALIGNMENT`]. Lookups map any address inside an allocation back to
//! its backing `Vec<u8>`, so sub-region slices work like device pointers.

use crate::error::{DeviceError, Result};
use crate::types::DeviceRegion;
use std::collections::BTreeMap;

/// Alignment of every host allocation in bytes
pub const HOST_ALIGNMENT: u64 = 256;

const BASE_ADDRESS: u64 = 0x1000_0000;

/// Backing store for all host device memory
pub struct HostMemory {
    /// Base address -> bytes
    allocations: BTreeMap<u64, Vec<u8>>,

    /// Next free address
    next_address: u64,

    bytes_in_use: usize,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            bytes_in_use: 0,
        }
    }

    /// Allocate zeroed memory. Zero-sized requests still reserve an address.
    pub fn allocate(&mut self, size: usize) -> DeviceRegion {
        let address = self.next_address;
        let span = (size.max(1) as u64).div_ceil(HOST_ALIGNMENT) * HOST_ALIGNMENT;
        self.next_address += span;
        self.allocations.insert(address, vec![0; size]);
        self.bytes_in_use += size;
        DeviceRegion::new(address, size)
    }

    /// Free the allocation starting at `address`, returning its size.
    pub fn free(&mut self, address: u64) -> Result<usize> {
        let bytes = self
            .allocations
            .remove(&address)
            .ok_or(DeviceError::InvalidAddress(address))?;
        self.bytes_in_use -= bytes.len();
        Ok(bytes.len())
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    fn locate(&self, region: DeviceRegion) -> Result<(u64, usize)> {
        let (base, bytes) = self
            .allocations
            .range(..=region.address())
            .next_back()
            .ok_or(DeviceError::InvalidAddress(region.address()))?;
        let offset = (region.address() - base) as usize;
        if offset + region.size() > bytes.len() {
            return Err(DeviceError::OutOfBounds {
                address: region.address(),
                size: region.size(),
                allocation_size: bytes.len(),
            });
        }
        Ok((*base, offset))
    }

    /// Copy the bytes of a region out.
    pub fn read(&self, region: DeviceRegion) -> Result<Vec<u8>> {
        if region.size() == 0 {
            return Ok(Vec::new());
        }
        let (base, offset) = self.locate(region)?;
        let bytes = &self.allocations[&base];
        Ok(bytes[offset..offset + region.size()].to_vec())
    }

    /// Write `data` at the start of `region`.
    pub fn write(&mut self, region: DeviceRegion, data: &[u8]) -> Result<()> {
        if data.len() > region.size() {
            return Err(DeviceError::OutOfBounds {
                address: region.address(),
                size: data.len(),
                allocation_size: region.size(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let target = DeviceRegion::new(region.address(), data.len());
        let (base, offset) = self.locate(target)?;
        let bytes = self
            .allocations
            .get_mut(&base)
            .ok_or(DeviceError::InvalidAddress(base))?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `size` bytes between two regions; ranges may overlap.
    pub fn copy(&mut self, destination: DeviceRegion, source: DeviceRegion, size: usize) -> Result<()> {
        let source = source.slice(0, size).ok_or(DeviceError::OutOfBounds {
            address: source.address(),
            size,
            allocation_size: source.size(),
        })?;
        let data = self.read(source)?;
        self.write(destination, &data)
    }

    /// Fill a region with `value`.
    pub fn fill(&mut self, region: DeviceRegion, value: u8) -> Result<()> {
        self.write(region, &vec![value; region.size()])
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let mut memory = HostMemory::new();
        let a = memory.allocate(10);
        let b = memory.allocate(300);
        assert!(a.is_aligned(HOST_ALIGNMENT));
        assert!(b.is_aligned(HOST_ALIGNMENT));
        assert_ne!(a.address(), b.address());
        assert_eq!(memory.read(a).unwrap(), vec![0; 10]);
        assert_eq!(memory.bytes_in_use(), 310);
    }

    #[test]
    fn sub_regions_resolve_to_their_allocation() {
        let mut memory = HostMemory::new();
        let region = memory.allocate(16);
        memory.write(region, &(0u8..16).collect::<Vec<_>>()).unwrap();

        let middle = region.slice(4, 4).unwrap();
        assert_eq!(memory.read(middle).unwrap(), vec![4, 5, 6, 7]);

        memory.write(middle, &[9, 9]).unwrap();
        assert_eq!(memory.read(region.slice(3, 4).unwrap()).unwrap(), vec![3, 9, 9, 6]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut memory = HostMemory::new();
        let region = memory.allocate(8);
        let overrun = DeviceRegion::new(region.address() + 4, 8);
        assert!(matches!(memory.read(overrun), Err(DeviceError::OutOfBounds { .. })));
        assert!(matches!(
            memory.read(DeviceRegion::new(0x10, 4)),
            Err(DeviceError::InvalidAddress(0x10))
        ));
    }

    #[test]
    fn free_releases_bytes() {
        let mut memory = HostMemory::new();
        let region = memory.allocate(64);
        assert_eq!(memory.free(region.address()).unwrap(), 64);
        assert_eq!(memory.live_allocations(), 0);
        assert!(memory.free(region.address()).is_err());
    }

    #[test]
    fn copy_and_fill() {
        let mut memory = HostMemory::new();
        let src = memory.allocate(4);
        let dst = memory.allocate(4);
        memory.fill(src, 0xAB).unwrap();
        memory.copy(dst, src, 4).unwrap();
        assert_eq!(memory.read(dst).unwrap(), vec![0xAB; 4]);
    }
}
