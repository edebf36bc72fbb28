//! Host backend
//!
//! Reference implementation of the device collaborator traits over process
//! memory. Streams execute synchronously, so work is complete as soon as the
//! enqueueing call returns.
//!
//! # Architecture
//!
//! ```text
//! HostDevice
//! ├── HostMemory       - synthetic address space shared by all ordinals
//! ├── kernels          - named closures standing in for compiled kernels
//! └── modules          - loaded images and their global symbols
//! HostAllocator        - capacity-limited allocator over HostMemory
//! HostCommunicatorFactory
//! └── HostCollectiveGroup - in-process all-reduce across ranks
//! ```
//!
//! # Usage
//!
//! ```rust
//! use meridian_device::host::HostDevice;
//! use meridian_device::{DeviceRuntime, DeviceOrdinal, LaunchDimensions, ModuleImage, StreamPriority};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = HostDevice::new(1);
//! device.register_kernel("double", |args| {
//!     let values: Vec<f32> = args.read_as(0)?;
//!     let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
//!     args.write_from(1, &doubled)
//! });
//!
//! let ordinal = DeviceOrdinal(0);
//! let module = device.load_module(ordinal, &ModuleImage::new("demo"))?;
//! let kernel = device.resolve_kernel(module, "double")?;
//! let input = device.allocate_raw(8);
//! let output = device.allocate_raw(8);
//! device.write_from(input, &[1.5f32, 2.0])?;
//!
//! let stream = device.borrow_streams(ordinal, 1, StreamPriority::Default)?[0];
//! device.launch(stream, kernel, &LaunchDimensions::linear(1, 2), &[input, output])?;
//! assert_eq!(device.read_as::<f32>(output)?, vec![3.0, 4.0]);
//! # Ok(())
//! # }
//! ```

mod allocator;
mod collective;
mod memory;

pub use allocator::HostAllocator;
pub use collective::{HostCommunicator, HostCommunicatorFactory};
pub use memory::{HostMemory, HOST_ALIGNMENT};

use crate::error::{DeviceError, Result};
use crate::traits::DeviceRuntime;
use crate::types::{
    ComputeCapability, DeviceDescription, DeviceOrdinal, DeviceRegion, KernelHandle, LaunchDimensions, ModuleHandle,
    ModuleImage, StreamHandle, StreamPriority,
};
use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kernel body executed by [`HostDevice::launch`]
pub type HostKernel = Arc<dyn Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync>;

/// Arguments visible to a host kernel
pub struct KernelArgs<'a> {
    memory: &'a mut HostMemory,
    args: &'a [DeviceRegion],
    dims: &'a LaunchDimensions,
}

impl KernelArgs<'_> {
    /// Number of region arguments
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn dims(&self) -> &LaunchDimensions {
        self.dims
    }

    pub fn region(&self, index: usize) -> Result<DeviceRegion> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| DeviceError::Other(format!("kernel argument {index} out of range ({})", self.args.len())))
    }

    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        self.memory.read(self.region(index)?)
    }

    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let region = self.region(index)?;
        self.memory.write(region, data)
    }

    /// Read argument `index` as a vector of `T`.
    pub fn read_as<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        Ok(decode(&self.read(index)?))
    }

    pub fn write_from<T: Pod>(&mut self, index: usize, values: &[T]) -> Result<()> {
        self.write(index, bytemuck::cast_slice(values))
    }
}

fn decode<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

struct LoadedModule {
    device: DeviceOrdinal,
    name: String,
    symbols: HashMap<String, DeviceRegion>,
}

/// Counters exposed for tests and benches
#[derive(Default)]
struct HostCounters {
    launches: AtomicU64,
    copies: AtomicU64,
    syncs: AtomicU64,
    modules_loaded: AtomicU64,
}

struct HostDeviceInner {
    device_count: u32,
    platform: String,
    compute_capability: ComputeCapability,
    memory: RwLock<HostMemory>,
    kernel_names: RwLock<HashMap<String, u64>>,
    kernels: RwLock<Vec<(String, HostKernel)>>,
    launches_by_kernel: Mutex<HashMap<String, u64>>,
    modules: RwLock<HashMap<u64, LoadedModule>>,
    next_module: AtomicU64,
    next_stream: AtomicU64,
    stream_limit: RwLock<Option<usize>>,
    counters: HostCounters,
}

/// Host platform exposing `device_count` ordinals over one address space
///
/// Cloning is cheap and every clone observes the same memory and counters.
#[derive(Clone)]
pub struct HostDevice {
    inner: Arc<HostDeviceInner>,
}

impl HostDevice {
    pub const PLATFORM: &'static str = "host";

    pub fn new(device_count: u32) -> Self {
        Self::with_description(device_count, Self::PLATFORM, ComputeCapability::new(1, 0))
    }

    /// Create a device reporting a custom platform name and capability.
    pub fn with_description(
        device_count: u32,
        platform: impl Into<String>,
        compute_capability: ComputeCapability,
    ) -> Self {
        Self {
            inner: Arc::new(HostDeviceInner {
                device_count,
                platform: platform.into(),
                compute_capability,
                memory: RwLock::new(HostMemory::new()),
                kernel_names: RwLock::new(HashMap::new()),
                kernels: RwLock::new(Vec::new()),
                launches_by_kernel: Mutex::new(HashMap::new()),
                modules: RwLock::new(HashMap::new()),
                next_module: AtomicU64::new(1),
                next_stream: AtomicU64::new(1),
                stream_limit: RwLock::new(None),
                counters: HostCounters::default(),
            }),
        }
    }

    pub fn device_count(&self) -> u32 {
        self.inner.device_count
    }

    pub fn platform(&self) -> &str {
        &self.inner.platform
    }

    /// Register (or replace) a kernel body under `name`.
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut kernels = self.inner.kernels.write();
        let mut names = self.inner.kernel_names.write();
        match names.get(&name) {
            Some(&index) => kernels[index as usize] = (name, Arc::new(body)),
            None => {
                names.insert(name.clone(), kernels.len() as u64);
                kernels.push((name, Arc::new(body)));
            }
        }
    }

    /// Cap the number of streams a single borrow call returns.
    pub fn set_stream_limit(&self, limit: Option<usize>) {
        *self.inner.stream_limit.write() = limit;
    }

    /// Allocate memory directly, bypassing any allocator accounting.
    pub fn allocate_raw(&self, size: usize) -> DeviceRegion {
        self.inner.memory.write().allocate(size)
    }

    pub fn free_raw(&self, address: u64) -> Result<usize> {
        self.inner.memory.write().free(address)
    }

    pub fn read(&self, region: DeviceRegion) -> Result<Vec<u8>> {
        self.inner.memory.read().read(region)
    }

    pub fn write(&self, region: DeviceRegion, data: &[u8]) -> Result<()> {
        self.inner.memory.write().write(region, data)
    }

    pub fn read_as<T: Pod>(&self, region: DeviceRegion) -> Result<Vec<T>> {
        Ok(decode(&self.read(region)?))
    }

    pub fn write_from<T: Pod>(&self, region: DeviceRegion, values: &[T]) -> Result<()> {
        self.write(region, bytemuck::cast_slice(values))
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.memory.read().live_allocations()
    }

    pub fn launch_count(&self) -> u64 {
        self.inner.counters.launches.load(Ordering::Relaxed)
    }

    /// Launches of the kernel registered under `name`
    pub fn launches_of(&self, name: &str) -> u64 {
        self.inner.launches_by_kernel.lock().get(name).copied().unwrap_or(0)
    }

    pub fn copy_count(&self) -> u64 {
        self.inner.counters.copies.load(Ordering::Relaxed)
    }

    pub fn sync_count(&self) -> u64 {
        self.inner.counters.syncs.load(Ordering::Relaxed)
    }

    pub fn modules_loaded(&self) -> u64 {
        self.inner.counters.modules_loaded.load(Ordering::Relaxed)
    }

    fn check_device(&self, device: DeviceOrdinal) -> Result<()> {
        if device.0 >= self.inner.device_count {
            return Err(DeviceError::UnknownDevice(device.to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("platform", &self.inner.platform)
            .field("device_count", &self.inner.device_count)
            .finish()
    }
}

impl DeviceRuntime for HostDevice {
    fn description(&self, device: DeviceOrdinal) -> Result<DeviceDescription> {
        self.check_device(device)?;
        Ok(DeviceDescription {
            platform: self.inner.platform.clone(),
            ordinal: device,
            compute_capability: self.inner.compute_capability,
        })
    }

    fn borrow_streams(
        &self,
        device: DeviceOrdinal,
        count: usize,
        _priority: StreamPriority,
    ) -> Result<Vec<StreamHandle>> {
        self.check_device(device)?;
        let granted = match *self.inner.stream_limit.read() {
            Some(limit) => count.min(limit),
            None => count,
        };
        Ok((0..granted)
            .map(|_| StreamHandle {
                device,
                id: self.inner.next_stream.fetch_add(1, Ordering::Relaxed),
            })
            .collect())
    }

    fn block_host_until_done(&self, stream: StreamHandle) -> Result<()> {
        self.check_device(stream.device)?;
        self.inner.counters.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_module(&self, device: DeviceOrdinal, image: &ModuleImage) -> Result<ModuleHandle> {
        self.check_device(device)?;
        let mut symbols = HashMap::new();
        {
            let mut memory = self.inner.memory.write();
            for global in &image.globals {
                symbols.insert(global.name.clone(), memory.allocate(global.size));
            }
        }
        let handle = self.inner.next_module.fetch_add(1, Ordering::Relaxed);
        self.inner.modules.write().insert(
            handle,
            LoadedModule {
                device,
                name: image.name.clone(),
                symbols,
            },
        );
        self.inner.counters.modules_loaded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(module = %image.name, %device, handle, "host module loaded");
        Ok(ModuleHandle(handle))
    }

    fn resolve_symbol(&self, module: ModuleHandle, name: &str) -> Result<Option<DeviceRegion>> {
        let modules = self.inner.modules.read();
        let loaded = modules.get(&module.0).ok_or(DeviceError::UnknownModule(module.0))?;
        Ok(loaded.symbols.get(name).copied())
    }

    fn resolve_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle> {
        let modules = self.inner.modules.read();
        let loaded = modules.get(&module.0).ok_or(DeviceError::UnknownModule(module.0))?;
        self.inner
            .kernel_names
            .read()
            .get(name)
            .map(|&index| KernelHandle(index))
            .ok_or_else(|| DeviceError::KernelNotFound(format!("{name} (module {} on {})", loaded.name, loaded.device)))
    }

    fn launch(
        &self,
        stream: StreamHandle,
        kernel: KernelHandle,
        dims: &LaunchDimensions,
        args: &[DeviceRegion],
    ) -> Result<()> {
        self.check_device(stream.device)?;
        let (name, body) = self
            .inner
            .kernels
            .read()
            .get(kernel.0 as usize)
            .cloned()
            .ok_or_else(|| DeviceError::KernelNotFound(format!("handle {}", kernel.0)))?;

        self.inner.counters.launches.fetch_add(1, Ordering::Relaxed);
        *self.inner.launches_by_kernel.lock().entry(name.clone()).or_insert(0) += 1;

        let mut memory = self.inner.memory.write();
        let mut kernel_args = KernelArgs {
            memory: &mut *memory,
            args,
            dims,
        };
        body(&mut kernel_args).map_err(|err| match err {
            DeviceError::KernelFailed { .. } => err,
            other => DeviceError::KernelFailed {
                kernel: name,
                message: other.to_string(),
            },
        })
    }

    fn copy_device_to_device(
        &self,
        stream: StreamHandle,
        destination: DeviceRegion,
        source: DeviceRegion,
        size: usize,
    ) -> Result<()> {
        self.check_device(stream.device)?;
        self.inner.counters.copies.fetch_add(1, Ordering::Relaxed);
        self.inner.memory.write().copy(destination, source, size)
    }

    fn copy_host_to_device(&self, stream: StreamHandle, destination: DeviceRegion, data: &[u8]) -> Result<()> {
        self.check_device(stream.device)?;
        self.inner.memory.write().write(destination, data)
    }

    fn copy_device_to_host(&self, stream: StreamHandle, destination: &mut [u8], source: DeviceRegion) -> Result<()> {
        self.check_device(stream.device)?;
        let region = source.slice(0, destination.len()).ok_or(DeviceError::OutOfBounds {
            address: source.address(),
            size: destination.len(),
            allocation_size: source.size(),
        })?;
        let bytes = self.inner.memory.read().read(region)?;
        destination.copy_from_slice(&bytes);
        Ok(())
    }

    fn memset(&self, stream: StreamHandle, destination: DeviceRegion, value: u8) -> Result<()> {
        self.check_device(stream.device)?;
        self.inner.memory.write().fill(destination, value)
    }
}
