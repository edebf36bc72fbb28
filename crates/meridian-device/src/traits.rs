//! Interfaces the dispatcher consumes from the device platform
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               meridian-runtime                │
//! └───────┬──────────────────┬────────────────────┘
//!         │ DeviceRuntime     │ DeviceAllocator
//!         ▼                   ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ streams,     │     │ allocate /   │
//! │ modules,     │     │ deallocate   │
//! │ launch, copy │     │ byte ranges  │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! Every call that takes a stream only *enqueues* work; completion is
//! observed through [`DeviceRuntime::block_host_until_done`].

use crate::error::Result;
use crate::types::{
    DeviceDescription, DeviceOrdinal, DeviceRegion, KernelHandle, LaunchDimensions, MemorySpace, ModuleHandle,
    ModuleImage, StreamHandle, StreamPriority,
};

/// Byte-addressable device memory allocator
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `size` bytes in `memory_space` on `device`.
    ///
    /// `retry_on_failure` lets the allocator attempt to free cached memory and
    /// try again before reporting [`DeviceError::OutOfMemory`](crate::DeviceError::OutOfMemory).
    fn allocate(
        &self,
        device: DeviceOrdinal,
        size: usize,
        retry_on_failure: bool,
        memory_space: MemorySpace,
    ) -> Result<DeviceRegion>;

    /// Return a region obtained from [`allocate`](Self::allocate).
    fn deallocate(&self, device: DeviceOrdinal, region: DeviceRegion) -> Result<()>;

    /// Whether regions may be released while device work that uses them is
    /// still queued. When false, callers must drain streams before releasing.
    fn allows_asynchronous_deallocation(&self) -> bool {
        false
    }
}

/// Streams, module loading, kernel launch and copies for a device platform
pub trait DeviceRuntime: Send + Sync {
    /// Describe a device
    fn description(&self, device: DeviceOrdinal) -> Result<DeviceDescription>;

    /// Borrow up to `count` streams. Implementations may return fewer than
    /// requested when the pool is exhausted.
    fn borrow_streams(&self, device: DeviceOrdinal, count: usize, priority: StreamPriority)
        -> Result<Vec<StreamHandle>>;

    /// Block the calling thread until all work queued on `stream` finished.
    fn block_host_until_done(&self, stream: StreamHandle) -> Result<()>;

    /// Load a module image onto a device.
    fn load_module(&self, device: DeviceOrdinal, image: &ModuleImage) -> Result<ModuleHandle>;

    /// Address of a global symbol in a loaded module, `None` if the symbol
    /// was never materialized.
    fn resolve_symbol(&self, module: ModuleHandle, name: &str) -> Result<Option<DeviceRegion>>;

    /// Resolve a kernel entry point in a loaded module.
    fn resolve_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle>;

    /// Enqueue a kernel launch.
    fn launch(
        &self,
        stream: StreamHandle,
        kernel: KernelHandle,
        dims: &LaunchDimensions,
        args: &[DeviceRegion],
    ) -> Result<()>;

    /// Enqueue a device-to-device copy of `size` bytes.
    fn copy_device_to_device(
        &self,
        stream: StreamHandle,
        destination: DeviceRegion,
        source: DeviceRegion,
        size: usize,
    ) -> Result<()>;

    /// Enqueue a host-to-device copy.
    fn copy_host_to_device(&self, stream: StreamHandle, destination: DeviceRegion, data: &[u8]) -> Result<()>;

    /// Enqueue a device-to-host copy. `destination` is valid once the stream
    /// has been drained.
    fn copy_device_to_host(&self, stream: StreamHandle, destination: &mut [u8], source: DeviceRegion) -> Result<()>;

    /// Enqueue a byte fill.
    fn memset(&self, stream: StreamHandle, destination: DeviceRegion, value: u8) -> Result<()>;
}
