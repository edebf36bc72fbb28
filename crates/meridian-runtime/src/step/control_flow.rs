use super::{Step, StepContext, StepInfo};
use crate::buffer::BufferSlice;
use crate::engine;
use crate::error::{Error, Result};
use meridian_device::StreamHandle;

/// Initialize nested sequences under the cliques they declare.
pub(super) fn initialize_sequences(sequences: &[&[Step]], ctx: &StepContext<'_>) -> Result<()> {
    let cliques = engine::acquire_nested(sequences, ctx)?;
    let ctx = ctx.with_cliques(&cliques);
    for steps in sequences {
        engine::initialize_steps(steps, &ctx)?;
    }
    Ok(())
}

pub(super) fn execute_sequence(steps: &[Step], ctx: &StepContext<'_>) -> Result<()> {
    let cliques = engine::acquire_nested(&[steps], ctx)?;
    engine::execute_steps(steps, &ctx.with_cliques(&cliques))
}

/// Copy `slice` to the host once every step queued on `stream` finished.
fn read_slice(ctx: &StepContext<'_>, stream: StreamHandle, slice: &BufferSlice) -> Result<Vec<u8>> {
    let region = ctx.buffers.slice(slice)?;
    let mut bytes = vec![0u8; region.size()];
    ctx.runtime.copy_device_to_host(stream, &mut bytes, region)?;
    ctx.runtime.block_host_until_done(stream)?;
    Ok(bytes)
}

/// Device loop
///
/// With a `trip_count` the body runs exactly that many times and the
/// condition is not evaluated. Otherwise each iteration runs `condition`,
/// reads the predicate byte and runs `body` while it is non-zero.
#[derive(Debug)]
pub struct WhileStep {
    pub condition: Vec<Step>,
    pub predicate: Option<BufferSlice>,
    pub body: Vec<Step>,
    pub trip_count: Option<u64>,
}

impl WhileStep {
    pub(super) fn initialize(&self, ctx: &StepContext<'_>) -> Result<()> {
        initialize_sequences(&[self.condition.as_slice(), self.body.as_slice()], ctx)
    }

    pub(super) fn execute(&self, info: &StepInfo, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let cliques = engine::acquire_nested(&[self.condition.as_slice(), self.body.as_slice()], ctx)?;
        let ctx = ctx.with_cliques(&cliques);

        if let Some(trip_count) = self.trip_count {
            for _ in 0..trip_count {
                engine::execute_steps(&self.body, &ctx)?;
            }
            return Ok(());
        }

        let predicate = self
            .predicate
            .ok_or_else(|| Error::internal(format!("loop {} has neither predicate nor trip count", info.annotation)))?;
        let mut iterations = 0u64;
        loop {
            engine::execute_steps(&self.condition, &ctx)?;
            let value = read_slice(&ctx, stream, &predicate)?;
            if value.first().copied().unwrap_or(0) == 0 {
                break;
            }
            engine::execute_steps(&self.body, &ctx)?;
            iterations += 1;
        }
        tracing::debug!(step = %info.annotation, iterations, "loop finished");
        Ok(())
    }
}

/// Encoding of a conditional's branch selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchIndexKind {
    /// One byte; non-zero selects branch 0, zero selects branch 1
    Bool,
    /// Little-endian i32; out-of-range values select the last branch
    Int32,
}

#[derive(Debug)]
pub struct ConditionalStep {
    pub branch_index: BufferSlice,
    pub index_kind: BranchIndexKind,
    pub branches: Vec<Vec<Step>>,
}

impl ConditionalStep {
    pub(super) fn initialize(&self, ctx: &StepContext<'_>) -> Result<()> {
        let sequences: Vec<&[Step]> = self.branches.iter().map(Vec::as_slice).collect();
        initialize_sequences(&sequences, ctx)
    }

    pub(super) fn execute(&self, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let bytes = read_slice(ctx, stream, &self.branch_index)?;
        let branch = self.select(&bytes)?;
        tracing::trace!(branch, "conditional branch selected");
        execute_sequence(&self.branches[branch], ctx)
    }

    fn select(&self, bytes: &[u8]) -> Result<usize> {
        let Some(last) = self.branches.len().checked_sub(1) else {
            return Err(Error::internal("conditional without branches"));
        };
        match self.index_kind {
            BranchIndexKind::Bool => {
                if self.branches.len() != 2 {
                    return Err(Error::internal(format!(
                        "boolean conditional needs 2 branches, has {}",
                        self.branches.len()
                    )));
                }
                let value = bytes
                    .first()
                    .ok_or_else(|| Error::internal("empty boolean branch selector"))?;
                Ok(if *value != 0 { 0 } else { 1 })
            }
            BranchIndexKind::Int32 => {
                let raw = bytes
                    .get(..4)
                    .ok_or_else(|| Error::internal(format!("branch selector {} is shorter than 4 bytes", self.branch_index)))?;
                let index: i32 = bytemuck::pod_read_unaligned(raw);
                Ok(usize::try_from(index).ok().filter(|i| *i < last).unwrap_or(last))
            }
        }
    }
}
