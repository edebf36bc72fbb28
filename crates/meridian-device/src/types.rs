//! Plain data exchanged between the runtime and device collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-local device index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceOrdinal(pub u32);

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Device identity agreed on by every cooperating process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalDeviceId(pub u64);

impl fmt::Display for GlobalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory space (allocation color) a region lives in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorySpace(pub u32);

impl MemorySpace {
    pub const DEFAULT: MemorySpace = MemorySpace(0);
}

/// A contiguous range of device memory
///
/// Regions are plain values; ownership is tracked by whoever allocated them.
/// The null region (address 0, size 0) stands for "no memory bound".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceRegion {
    address: u64,
    size: usize,
}

impl DeviceRegion {
    pub const fn new(address: u64, size: usize) -> Self {
        Self { address, size }
    }

    /// The null region
    pub const fn empty() -> Self {
        Self { address: 0, size: 0 }
    }

    pub const fn address(&self) -> u64 {
        self.address
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// True if no memory is bound
    pub const fn is_null(&self) -> bool {
        self.address == 0
    }

    pub const fn is_aligned(&self, alignment: u64) -> bool {
        alignment == 0 || self.address % alignment == 0
    }

    /// Sub-range starting `offset` bytes in. Returns `None` if it would overrun.
    pub fn slice(&self, offset: usize, size: usize) -> Option<DeviceRegion> {
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        Some(DeviceRegion::new(self.address + offset as u64, size))
    }
}

impl fmt::Display for DeviceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}; {}]", self.address, self.size)
    }
}

/// Handle to an execution stream on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub device: DeviceOrdinal,
    pub id: u64,
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/stream{}", self.device, self.id)
    }
}

/// Scheduling priority requested when borrowing streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StreamPriority {
    #[default]
    Default,
    Highest,
}

/// Handle to a module loaded on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Handle to a kernel resolved from a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Global variable a module image declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSymbol {
    pub name: String,
    pub size: usize,
}

/// Compiled device code handed to the loader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub binary: Vec<u8>,
    pub globals: Vec<GlobalSymbol>,
}

impl ModuleImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_global(mut self, name: impl Into<String>, size: usize) -> Self {
        self.globals.push(GlobalSymbol { name: name.into(), size });
        self
    }
}

/// Grid dimensions for kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// Block dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_threads(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// Launch configuration for a kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LaunchDimensions {
    pub grid: GridDim,
    pub block: BlockDim,
    pub shared_memory_bytes: u32,
}

impl LaunchDimensions {
    pub const fn linear(blocks: u32, threads: u32) -> Self {
        Self {
            grid: GridDim::linear(blocks),
            block: BlockDim::linear(threads),
            shared_memory_bytes: 0,
        }
    }
}

impl fmt::Display for LaunchDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid=({}, {}, {}) block=({}, {}, {})",
            self.grid.x, self.grid.y, self.grid.z, self.block.x, self.block.y, self.block.z
        )
    }
}

/// Compute capability of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What a runtime reports about one of its devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub platform: String,
    pub ordinal: DeviceOrdinal,
    pub compute_capability: ComputeCapability,
}

/// Element types understood by collectives and shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Pred,
    U8,
    I32,
    U32,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            ElementType::Pred | ElementType::U8 => 1,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Pred => "pred",
            ElementType::U8 => "u8",
            ElementType::I32 => "s32",
            ElementType::U32 => "u32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Reduction applied by all-reduce style collectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionKind {
    Sum,
    Min,
    Max,
}
