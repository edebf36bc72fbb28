use super::{StepContext, StepInfo};
use crate::buffer::BufferSlice;
use crate::custom_call::CustomCallFrame;
use crate::error::{Error, Result};
use meridian_device::StreamHandle;

/// Call into a handler registered for the device platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCallStep {
    pub target: String,
    pub operands: Vec<BufferSlice>,
    pub results: Vec<BufferSlice>,
    pub opaque: Vec<u8>,
}

impl CustomCallStep {
    pub fn with_opaque(mut self, opaque: impl Into<Vec<u8>>) -> Self {
        self.opaque = opaque.into();
        self
    }

    pub(super) fn initialize(&self, info: &StepInfo, ctx: &StepContext<'_>) -> Result<()> {
        if ctx.services.custom_calls().contains(ctx.platform, &self.target) {
            return Ok(());
        }
        if ctx.debug().mock_unimplemented_custom_calls {
            tracing::warn!(
                step = %info.annotation,
                target = %self.target,
                platform = ctx.platform,
                "custom call target not registered; executing as a no-op"
            );
            return Ok(());
        }
        Err(self.unregistered(ctx))
    }

    pub(super) fn execute(&self, info: &StepInfo, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let Some(handler) = ctx.services.custom_calls().lookup(ctx.platform, &self.target) else {
            if ctx.debug().mock_unimplemented_custom_calls {
                return Ok(());
            }
            return Err(self.unregistered(ctx));
        };
        let slices = |slices: &[BufferSlice]| {
            slices
                .iter()
                .map(|slice| ctx.buffers.slice(slice))
                .collect::<Result<Vec<_>>>()
        };
        let frame = CustomCallFrame {
            runtime: ctx.runtime,
            device: ctx.device,
            stream,
            operands: slices(&self.operands)?,
            results: slices(&self.results)?,
            opaque: &self.opaque,
        };
        handler(&frame).map_err(|err| match err {
            Error::Internal(msg) => Error::internal(format!("custom call {} ({}): {msg}", self.target, info.annotation)),
            other => other,
        })
    }

    fn unregistered(&self, ctx: &StepContext<'_>) -> Error {
        Error::unimplemented(format!(
            "no custom call handler for target {} on platform {}",
            self.target, ctx.platform
        ))
    }
}
