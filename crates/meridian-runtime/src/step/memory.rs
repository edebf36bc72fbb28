use super::StepContext;
use crate::buffer::BufferSlice;
use crate::error::{Error, Result};
use meridian_device::StreamHandle;

/// Device-to-device copy between two slices of equal size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStep {
    pub source: BufferSlice,
    pub destination: BufferSlice,
}

impl CopyStep {
    pub(super) fn execute(&self, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        if self.source.size != self.destination.size {
            return Err(Error::internal(format!(
                "copy from {} to {} changes size",
                self.source, self.destination
            )));
        }
        let source = ctx.buffers.slice(&self.source)?;
        let destination = ctx.buffers.slice(&self.destination)?;
        if source.size() == 0 || source == destination {
            return Ok(());
        }
        ctx.runtime
            .copy_device_to_device(stream, destination, source, source.size())?;
        Ok(())
    }
}

/// Byte fill of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemsetStep {
    pub destination: BufferSlice,
    pub value: u8,
}

impl MemsetStep {
    pub(super) fn execute(&self, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let destination = ctx.buffers.slice(&self.destination)?;
        if destination.size() == 0 {
            return Ok(());
        }
        ctx.runtime.memset(stream, destination, self.value)?;
        Ok(())
    }
}
