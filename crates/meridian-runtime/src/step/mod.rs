//! Executable steps
//!
//! A [`Step`] is one unit of device work. Every step goes through three
//! phases, each applied to the whole sequence before the next begins:
//!
//! 1. **Prepare**: declare clique requirements; no buffers or streams
//! 2. **Initialize**: one-time setup with buffers, cliques and streams bound
//! 3. **Execute**: enqueue device work in program order
//!
//! Control-flow steps own nested sequences. Nested sequences declare and
//! acquire their cliques when the owning step initializes or executes.

mod collective;
mod command_buffer;
mod control_flow;
mod custom_call;
mod kernel;
mod memory;

pub use collective::{CollectiveOp, CollectiveStep};
pub use command_buffer::CommandBufferStep;
pub use control_flow::{BranchIndexKind, ConditionalStep, WhileStep};
pub use custom_call::CustomCallStep;
pub use kernel::KernelStep;
pub use memory::{CopyStep, MemsetStep};

use crate::buffer::{BufferSlice, BufferTable};
use crate::clique::{AcquiredCliques, CliqueRequests, CollectiveParams};
use crate::config::DebugOptions;
use crate::error::{Error, Result};
use crate::profile::ExecutionProfile;
use crate::services::RuntimeServices;
use meridian_device::{DeviceOrdinal, DeviceRuntime, LaunchDimensions, ModuleHandle, StreamHandle};

/// Diagnostics and scheduling attributes shared by every step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub annotation: String,
    /// 0 is the main stream; `n` is the n-th additional compute stream
    pub execution_stream: usize,
}

#[derive(Debug)]
pub enum StepKind {
    Kernel(KernelStep),
    Copy(CopyStep),
    Memset(MemsetStep),
    Collective(CollectiveStep),
    Sequential(Vec<Step>),
    While(WhileStep),
    Conditional(ConditionalStep),
    CommandBuffer(CommandBufferStep),
    CustomCall(CustomCallStep),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Kernel(_) => "kernel",
            StepKind::Copy(_) => "copy",
            StepKind::Memset(_) => "memset",
            StepKind::Collective(_) => "collective",
            StepKind::Sequential(_) => "sequential",
            StepKind::While(_) => "while",
            StepKind::Conditional(_) => "conditional",
            StepKind::CommandBuffer(_) => "command_buffer",
            StepKind::CustomCall(_) => "custom_call",
        }
    }

    /// Buffer slices this step addresses directly
    pub fn buffer_slices(&self) -> Vec<BufferSlice> {
        match self {
            StepKind::Kernel(kernel) => kernel.args.clone(),
            StepKind::Copy(copy) => vec![copy.source, copy.destination],
            StepKind::Memset(memset) => vec![memset.destination],
            StepKind::Collective(collective) => vec![collective.source, collective.destination],
            StepKind::While(w) => w.predicate.into_iter().collect(),
            StepKind::Conditional(c) => vec![c.branch_index],
            StepKind::CustomCall(call) => call.operands.iter().chain(&call.results).copied().collect(),
            StepKind::Sequential(_) | StepKind::CommandBuffer(_) => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Step {
    pub info: StepInfo,
    pub kind: StepKind,
}

/// Inputs to the Prepare phase
#[derive(Debug, Clone, Copy)]
pub struct PrepareParams<'a> {
    pub collective: Option<&'a CollectiveParams>,
    pub debug: &'a DebugOptions,
}

/// Everything bound for Initialize and Execute
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub runtime: &'a dyn DeviceRuntime,
    pub device: DeviceOrdinal,
    pub platform: &'a str,
    pub module: ModuleHandle,
    pub buffers: &'a BufferTable,
    /// Main compute stream
    pub stream: StreamHandle,
    /// Additional compute streams; index `n - 1` serves execution stream `n`
    pub compute_streams: &'a [StreamHandle],
    pub async_streams: &'a [StreamHandle],
    pub collective: Option<&'a CollectiveParams>,
    pub cliques: &'a AcquiredCliques,
    pub services: &'a RuntimeServices,
    pub profile: Option<&'a ExecutionProfile>,
}

impl<'a> StepContext<'a> {
    pub fn debug(&self) -> &'a DebugOptions {
        &self.services.config().debug
    }

    pub fn prepare_params(&self) -> PrepareParams<'a> {
        PrepareParams {
            collective: self.collective,
            debug: self.debug(),
        }
    }

    /// Same bindings with a different set of acquired cliques
    pub fn with_cliques<'b>(&self, cliques: &'b AcquiredCliques) -> StepContext<'b>
    where
        'a: 'b,
    {
        StepContext {
            runtime: self.runtime,
            device: self.device,
            platform: self.platform,
            module: self.module,
            buffers: self.buffers,
            stream: self.stream,
            compute_streams: self.compute_streams,
            async_streams: self.async_streams,
            collective: self.collective,
            cliques,
            services: self.services,
            profile: self.profile,
        }
    }

    /// Stream assigned to a step
    pub fn stream_for(&self, info: &StepInfo) -> Result<StreamHandle> {
        match info.execution_stream {
            0 => Ok(self.stream),
            n => self.compute_streams.get(n - 1).copied().ok_or_else(|| {
                Error::failed_precondition(format!(
                    "step {} needs execution stream {n} but only {} additional streams were borrowed",
                    info.annotation,
                    self.compute_streams.len()
                ))
            }),
        }
    }

    pub fn async_stream(&self, index: usize, info: &StepInfo) -> Result<StreamHandle> {
        self.async_streams.get(index).copied().ok_or_else(|| {
            Error::failed_precondition(format!(
                "step {} needs async stream {index} but only {} were borrowed",
                info.annotation,
                self.async_streams.len()
            ))
        })
    }
}

impl Step {
    pub fn new(annotation: impl Into<String>, kind: StepKind) -> Self {
        Self {
            info: StepInfo {
                annotation: annotation.into(),
                execution_stream: 0,
            },
            kind,
        }
    }

    pub fn kernel(
        annotation: impl Into<String>,
        name: impl Into<String>,
        args: Vec<BufferSlice>,
        dims: LaunchDimensions,
    ) -> Self {
        Self::new(annotation, StepKind::Kernel(KernelStep::new(name, args, dims)))
    }

    pub fn copy(annotation: impl Into<String>, source: BufferSlice, destination: BufferSlice) -> Self {
        Self::new(annotation, StepKind::Copy(CopyStep { source, destination }))
    }

    pub fn memset(annotation: impl Into<String>, destination: BufferSlice, value: u8) -> Self {
        Self::new(annotation, StepKind::Memset(MemsetStep { destination, value }))
    }

    pub fn collective(annotation: impl Into<String>, collective: CollectiveStep) -> Self {
        Self::new(annotation, StepKind::Collective(collective))
    }

    pub fn sequential(annotation: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::new(annotation, StepKind::Sequential(steps))
    }

    /// Loop running `condition` then `body` while the predicate byte is non-zero
    pub fn while_loop(
        annotation: impl Into<String>,
        condition: Vec<Step>,
        predicate: BufferSlice,
        body: Vec<Step>,
    ) -> Self {
        Self::new(
            annotation,
            StepKind::While(WhileStep {
                condition,
                predicate: Some(predicate),
                body,
                trip_count: None,
            }),
        )
    }

    /// Loop with a trip count known at lowering time
    pub fn for_loop(annotation: impl Into<String>, trip_count: u64, body: Vec<Step>) -> Self {
        Self::new(
            annotation,
            StepKind::While(WhileStep {
                condition: Vec::new(),
                predicate: None,
                body,
                trip_count: Some(trip_count),
            }),
        )
    }

    pub fn conditional(
        annotation: impl Into<String>,
        branch_index: BufferSlice,
        index_kind: BranchIndexKind,
        branches: Vec<Vec<Step>>,
    ) -> Self {
        Self::new(
            annotation,
            StepKind::Conditional(ConditionalStep {
                branch_index,
                index_kind,
                branches,
            }),
        )
    }

    pub fn command_buffer(annotation: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::new(annotation, StepKind::CommandBuffer(CommandBufferStep::new(steps)))
    }

    pub fn custom_call(
        annotation: impl Into<String>,
        target: impl Into<String>,
        operands: Vec<BufferSlice>,
        results: Vec<BufferSlice>,
    ) -> Self {
        Self::new(
            annotation,
            StepKind::CustomCall(CustomCallStep {
                target: target.into(),
                operands,
                results,
                opaque: Vec::new(),
            }),
        )
    }

    /// Run on additional execution stream `stream` (0 is the main stream).
    pub fn on_stream(mut self, stream: usize) -> Self {
        self.info.execution_stream = stream;
        self
    }

    /// Flag a kernel as not bit-reproducible. Other kinds are unaffected.
    pub fn nondeterministic(mut self) -> Self {
        if let StepKind::Kernel(kernel) = &mut self.kind {
            kernel.nondeterministic = true;
        }
        self
    }

    pub fn annotation(&self) -> &str {
        &self.info.annotation
    }

    /// Nested step sequences owned by this step
    pub fn nested(&self) -> Vec<&[Step]> {
        match &self.kind {
            StepKind::Sequential(steps) => vec![steps.as_slice()],
            StepKind::While(w) => vec![w.condition.as_slice(), w.body.as_slice()],
            StepKind::Conditional(c) => c.branches.iter().map(Vec::as_slice).collect(),
            StepKind::CommandBuffer(cb) => vec![cb.steps()],
            _ => Vec::new(),
        }
    }

    /// Call `f` on this step and every nested step, in preorder.
    pub fn visit<F: FnMut(&Step)>(&self, f: &mut F) {
        f(self);
        for sequence in self.nested() {
            for step in sequence {
                step.visit(f);
            }
        }
    }

    pub fn prepare(&self, params: &PrepareParams<'_>, requests: &mut CliqueRequests) -> Result<()> {
        match &self.kind {
            StepKind::Kernel(kernel) => kernel.prepare(&self.info, params),
            StepKind::Collective(collective) => collective.prepare(&self.info, params, requests),
            _ => Ok(()),
        }
    }

    pub fn initialize(&self, ctx: &StepContext<'_>) -> Result<()> {
        match &self.kind {
            StepKind::Kernel(kernel) => kernel.initialize(&self.info, ctx),
            StepKind::Sequential(steps) => control_flow::initialize_sequences(&[steps.as_slice()], ctx),
            StepKind::While(w) => w.initialize(ctx),
            StepKind::Conditional(c) => c.initialize(ctx),
            StepKind::CommandBuffer(cb) => cb.initialize(&self.info, ctx),
            StepKind::CustomCall(call) => call.initialize(&self.info, ctx),
            StepKind::Copy(_) | StepKind::Memset(_) | StepKind::Collective(_) => Ok(()),
        }
    }

    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        let stream = ctx.stream_for(&self.info)?;
        tracing::trace!(step = %self.info.annotation, kind = self.kind.name(), %stream, "executing step");
        match &self.kind {
            StepKind::Kernel(kernel) => kernel.execute(&self.info, ctx, stream),
            StepKind::Copy(copy) => copy.execute(ctx, stream),
            StepKind::Memset(memset) => memset.execute(ctx, stream),
            StepKind::Collective(collective) => collective.execute(&self.info, ctx, stream),
            StepKind::Sequential(steps) => control_flow::execute_sequence(steps, ctx),
            StepKind::While(w) => w.execute(&self.info, ctx, stream),
            StepKind::Conditional(c) => c.execute(ctx, stream),
            StepKind::CommandBuffer(cb) => cb.execute(&self.info, ctx),
            StepKind::CustomCall(call) => call.execute(&self.info, ctx, stream),
        }
    }
}
