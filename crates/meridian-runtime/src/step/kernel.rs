use super::{PrepareParams, StepContext, StepInfo};
use crate::buffer::BufferSlice;
use crate::error::{Error, Result};
use meridian_device::{KernelHandle, LaunchDimensions, ModuleHandle, StreamHandle};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Launch of a kernel from the executable's module
#[derive(Debug)]
pub struct KernelStep {
    pub name: String,
    pub args: Vec<BufferSlice>,
    pub dims: LaunchDimensions,
    /// Results may differ between runs with identical inputs
    pub nondeterministic: bool,
    handles: Mutex<HashMap<ModuleHandle, KernelHandle>>,
}

impl KernelStep {
    pub fn new(name: impl Into<String>, args: Vec<BufferSlice>, dims: LaunchDimensions) -> Self {
        Self {
            name: name.into(),
            args,
            dims,
            nondeterministic: false,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn prepare(&self, info: &StepInfo, params: &PrepareParams<'_>) -> Result<()> {
        if self.nondeterministic && params.debug.deterministic_ops {
            return Err(Error::failed_precondition(format!(
                "step {} launches non-deterministic kernel {} but deterministic ops are required",
                info.annotation, self.name
            )));
        }
        Ok(())
    }

    pub(super) fn initialize(&self, info: &StepInfo, ctx: &StepContext<'_>) -> Result<()> {
        self.handle(info, ctx).map(|_| ())
    }

    pub(super) fn execute(&self, info: &StepInfo, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let kernel = self.handle(info, ctx)?;
        let args = self
            .args
            .iter()
            .map(|slice| ctx.buffers.slice(slice))
            .collect::<Result<Vec<_>>>()?;
        ctx.runtime.launch(stream, kernel, &self.dims, &args)?;
        Ok(())
    }

    /// Kernel handle for the context's module, resolved once per module.
    fn handle(&self, info: &StepInfo, ctx: &StepContext<'_>) -> Result<KernelHandle> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&ctx.module) {
            return Ok(*handle);
        }
        let handle = ctx.runtime.resolve_kernel(ctx.module, &self.name).map_err(|err| {
            Error::internal(format!("step {}: cannot resolve kernel {}: {err}", info.annotation, self.name))
        })?;
        handles.insert(ctx.module, handle);
        Ok(handle)
    }
}
