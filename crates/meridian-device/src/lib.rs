//! Device collaborator interfaces for the meridian dispatcher
//!
//! This crate provides:
//! - **Traits** for the collaborators the execution engine consumes:
//!   [`DeviceRuntime`], [`DeviceAllocator`], [`Communicator`] and
//!   [`CommunicatorFactory`]
//! - **Plain data types** exchanged with them (regions, streams, modules)
//! - **Host backend**: a reference implementation of every trait over
//!   process memory, used by tests, benches and CPU-only deployments
//!
//! ```rust
//! use meridian_device::host::{HostAllocator, HostDevice};
//! use meridian_device::{DeviceAllocator, DeviceOrdinal, DeviceRuntime, MemorySpace, StreamPriority};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = HostDevice::new(1);
//! let allocator = HostAllocator::new(device.clone());
//!
//! let ordinal = DeviceOrdinal(0);
//! let region = allocator.allocate(ordinal, 16, false, MemorySpace::DEFAULT)?;
//! let stream = device.borrow_streams(ordinal, 1, StreamPriority::Default)?[0];
//! device.copy_host_to_device(stream, region, &[7u8; 16])?;
//! device.block_host_until_done(stream)?;
//! assert_eq!(device.read(region)?, vec![7u8; 16]);
//!
//! allocator.deallocate(ordinal, region)?;
//! # Ok(())
//! # }
//! ```

pub mod communicator;
pub mod error;
pub mod host;
pub mod traits;
pub mod types;

pub use communicator::{CliqueId, Communicator, CommunicatorFactory, CommunicatorRank};
pub use error::{DeviceError, Result};
pub use traits::{DeviceAllocator, DeviceRuntime};
pub use types::{
    BlockDim, ComputeCapability, DeviceDescription, DeviceOrdinal, DeviceRegion, ElementType, GlobalDeviceId,
    GlobalSymbol, GridDim, KernelHandle, LaunchDimensions, MemorySpace, ModuleHandle, ModuleImage, ReductionKind,
    StreamHandle, StreamPriority,
};
