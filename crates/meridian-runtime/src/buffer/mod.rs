//! Argument buffers and the per-execution buffer table
//!
//! ```text
//! Arguments ──┐
//! constants ──┼─► resolve_buffers ──► BufferTable (one region per slot)
//! allocator ──┘          │
//!                        └─► OwnedAllocations (released on drop)
//! ```

mod resolver;
mod teardown;

pub use resolver::resolve_buffers;
pub use teardown::OwnedAllocations;

use crate::error::{Error, Result};
use crate::shape::{Shape, ShapeIndex, ShapeTree};
use meridian_device::DeviceRegion;
use std::fmt;

/// Byte range within one allocation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub allocation: usize,
    pub offset: usize,
    pub size: usize,
}

impl BufferSlice {
    pub const fn new(allocation: usize, offset: usize, size: usize) -> Self {
        Self {
            allocation,
            offset,
            size,
        }
    }
}

impl fmt::Display for BufferSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}[{}..{}]", self.allocation, self.offset, self.offset.saturating_add(self.size))
    }
}

/// One argument buffer and whether the engine may take ownership of it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputBuffer {
    pub region: DeviceRegion,
    pub donated: bool,
}

/// Argument whose buffers may be donated to the execution
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    shape: Shape,
    buffers: ShapeTree<InputBuffer>,
}

impl ExecutionInput {
    /// Input with every position unbound
    pub fn new(shape: Shape) -> Self {
        let buffers = ShapeTree::filled(&shape, InputBuffer::default());
        Self { shape, buffers }
    }

    /// Array input the caller keeps ownership of
    pub fn borrowed(shape: Shape, region: DeviceRegion) -> Self {
        Self::with_root(shape, region, false)
    }

    /// Array input whose buffer is handed to the execution
    pub fn donated(shape: Shape, region: DeviceRegion) -> Self {
        Self::with_root(shape, region, true)
    }

    fn with_root(shape: Shape, region: DeviceRegion, donated: bool) -> Self {
        let mut input = Self::new(shape);
        if let Some(root) = input.buffers.get_mut(&ShapeIndex::root()) {
            *root = InputBuffer { region, donated };
        }
        input
    }

    pub fn set_buffer(&mut self, index: &ShapeIndex, region: DeviceRegion, donated: bool) -> Result<()> {
        let slot = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| Error::invalid_argument(format!("{index} is not a position of {}", self.shape)))?;
        *slot = InputBuffer { region, donated };
        Ok(())
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<&InputBuffer> {
        self.buffers.get(index)
    }

    pub fn buffers(&self) -> &ShapeTree<InputBuffer> {
        &self.buffers
    }
}

/// Argument the caller keeps full ownership of
#[derive(Debug, Clone)]
pub struct ShapedBuffer {
    pub shape: Shape,
    pub buffers: ShapeTree<DeviceRegion>,
}

impl ShapedBuffer {
    pub fn new(shape: Shape) -> Self {
        let buffers = ShapeTree::filled(&shape, DeviceRegion::empty());
        Self { shape, buffers }
    }

    pub fn from_region(shape: Shape, region: DeviceRegion) -> Self {
        let mut buffer = Self::new(shape);
        if let Some(root) = buffer.buffers.get_mut(&ShapeIndex::root()) {
            *root = region;
        }
        buffer
    }
}

/// Entry arguments of one execution
#[derive(Debug, Clone)]
pub enum Arguments {
    Shaped(Vec<ShapedBuffer>),
    Inputs(Vec<ExecutionInput>),
}

impl Arguments {
    pub fn none() -> Self {
        Arguments::Shaped(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Arguments::Shaped(buffers) => buffers.len(),
            Arguments::Inputs(inputs) => inputs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer bound at (`parameter`, `index`), if that position exists
    pub fn buffer(&self, parameter: usize, index: &ShapeIndex) -> Option<InputBuffer> {
        match self {
            Arguments::Shaped(buffers) => buffers
                .get(parameter)?
                .buffers
                .get(index)
                .map(|&region| InputBuffer { region, donated: false }),
            Arguments::Inputs(inputs) => inputs.get(parameter)?.buffer(index).copied(),
        }
    }

    /// Every donated, non-null region
    pub fn donated_regions(&self) -> Vec<DeviceRegion> {
        match self {
            Arguments::Shaped(_) => Vec::new(),
            Arguments::Inputs(inputs) => inputs
                .iter()
                .flat_map(|input| input.buffers.iter())
                .filter(|(_, buffer)| buffer.donated && !buffer.region.is_null())
                .map(|(_, buffer)| buffer.region)
                .collect(),
        }
    }
}

/// Concrete region for every allocation slot of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferTable {
    regions: Vec<DeviceRegion>,
}

impl BufferTable {
    pub fn new(regions: Vec<DeviceRegion>) -> Self {
        Self { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[DeviceRegion] {
        &self.regions
    }

    pub fn get(&self, allocation: usize) -> Result<DeviceRegion> {
        self.regions
            .get(allocation)
            .copied()
            .ok_or_else(|| Error::internal(format!("allocation slot {allocation} is not in the buffer table")))
    }

    pub fn slice(&self, slice: &BufferSlice) -> Result<DeviceRegion> {
        let base = self.get(slice.allocation)?;
        if base.is_null() && slice.size == 0 {
            return Ok(DeviceRegion::empty());
        }
        base.slice(slice.offset, slice.size)
            .ok_or_else(|| Error::internal(format!("{slice} overruns bound region {base}")))
    }

    pub(crate) fn set(&mut self, allocation: usize, region: DeviceRegion) -> Result<()> {
        let entry = self
            .regions
            .get_mut(allocation)
            .ok_or_else(|| Error::internal(format!("allocation slot {allocation} is not in the buffer table")))?;
        *entry = region;
        Ok(())
    }
}
