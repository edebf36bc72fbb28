use super::control_flow::{execute_sequence, initialize_sequences};
use super::{Step, StepContext, StepInfo, StepKind};
use crate::clique::CliqueStreamKind;
use crate::error::{Error, Result};
use meridian_device::DeviceOrdinal;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Nested sequence initialized once per device
///
/// Initialize runs the nested steps' Initialize the first time a device sees
/// this step and marks that device recorded; later Initialize calls on the
/// same device are no-ops. Execute dispatches the nested steps again in
/// order on every execution and fails on a device that was never recorded.
///
/// Collectives inside a command buffer use cliques of kind
/// [`CliqueStreamKind::CommandBuffer`], separate from the cliques used by
/// the same devices on compute streams.
#[derive(Debug)]
pub struct CommandBufferStep {
    steps: Vec<Step>,
    recorded: Mutex<HashSet<DeviceOrdinal>>,
    recordings: AtomicU64,
}

impl CommandBufferStep {
    pub fn new(mut steps: Vec<Step>) -> Self {
        for step in &mut steps {
            use_command_buffer_cliques(step);
        }
        Self {
            steps,
            recorded: Mutex::new(HashSet::new()),
            recordings: AtomicU64::new(0),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of nested Initialize passes, across devices
    pub fn recordings(&self) -> u64 {
        self.recordings.load(Ordering::Relaxed)
    }

    pub fn is_recorded(&self, device: DeviceOrdinal) -> bool {
        self.recorded.lock().contains(&device)
    }

    pub(super) fn initialize(&self, info: &StepInfo, ctx: &StepContext<'_>) -> Result<()> {
        if self.is_recorded(ctx.device) {
            return Ok(());
        }
        initialize_sequences(&[self.steps.as_slice()], ctx)?;
        if self.recorded.lock().insert(ctx.device) {
            self.recordings.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(step = %info.annotation, device = %ctx.device, steps = self.steps.len(), "command buffer recorded");
        }
        Ok(())
    }

    pub(super) fn execute(&self, info: &StepInfo, ctx: &StepContext<'_>) -> Result<()> {
        if !self.is_recorded(ctx.device) {
            return Err(Error::failed_precondition(format!(
                "command buffer {} executed on {} before it was recorded",
                info.annotation, ctx.device
            )));
        }
        execute_sequence(&self.steps, ctx)
    }
}

fn use_command_buffer_cliques(step: &mut Step) {
    match &mut step.kind {
        StepKind::Collective(collective) => collective.stream_kind = CliqueStreamKind::CommandBuffer,
        StepKind::Sequential(steps) => steps.iter_mut().for_each(use_command_buffer_cliques),
        StepKind::While(w) => w
            .condition
            .iter_mut()
            .chain(w.body.iter_mut())
            .for_each(use_command_buffer_cliques),
        StepKind::Conditional(c) => c.branches.iter_mut().flatten().for_each(use_command_buffer_cliques),
        StepKind::CommandBuffer(cb) => cb.steps.iter_mut().for_each(use_command_buffer_cliques),
        StepKind::Kernel(_) | StepKind::Copy(_) | StepKind::Memset(_) | StepKind::CustomCall(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::Fixture;
    use super::super::CollectiveStep;
    use super::*;
    use crate::buffer::BufferSlice;
    use crate::error::ErrorKind;
    use meridian_device::{ElementType, GlobalDeviceId, ReductionKind};

    #[test]
    fn nested_collectives_switch_clique_kind() {
        let collective = CollectiveStep::all_reduce(
            vec![GlobalDeviceId(0)],
            1,
            ElementType::U32,
            1,
            ReductionKind::Sum,
            BufferSlice::new(0, 0, 4),
            BufferSlice::new(0, 0, 4),
        );
        let step = Step::command_buffer(
            "cb",
            vec![Step::sequential("inner", vec![Step::collective("ar", collective)])],
        );

        let mut kinds = Vec::new();
        step.visit(&mut |s| {
            if let StepKind::Collective(c) = &s.kind {
                kinds.push(c.stream_kind);
            }
        });
        assert_eq!(kinds, vec![CliqueStreamKind::CommandBuffer]);
    }

    #[test]
    fn nested_initialize_runs_once_per_device() {
        let fixture = Fixture::new(&[4]);
        let inner = Step::command_buffer("inner", vec![Step::memset("fill", BufferSlice::new(0, 0, 4), 9)]);
        let step = Step::command_buffer("cb", vec![inner]);
        let ctx = fixture.context();

        let err = step.execute(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        step.initialize(&ctx).unwrap();
        step.initialize(&ctx).unwrap();
        step.execute(&ctx).unwrap();
        step.execute(&ctx).unwrap();

        let StepKind::CommandBuffer(outer) = &step.kind else {
            panic!("expected a command buffer");
        };
        let StepKind::CommandBuffer(inner) = &outer.steps()[0].kind else {
            panic!("expected a nested command buffer");
        };
        assert_eq!(outer.recordings(), 1);
        assert_eq!(inner.recordings(), 1);
        assert!(inner.is_recorded(ctx.device));
        assert_eq!(fixture.read::<u8>(0), vec![9; 4]);
    }
}
