//! Executable entry point
//!
//! [`Executable::execute`] runs one finalized plan on one device:
//!
//! 1. check the plan's target against the device
//! 2. take the device access lock (shared unless the run asks for exclusive)
//! 3. load the module once per device and resolve constants
//! 4. bind every allocation slot, then apply output aliasing
//! 5. borrow additional compute and async collective streams
//! 6. drive the steps through prepare, acquire, initialize and execute
//! 7. hand result regions to the caller and release everything else

use crate::buffer::{resolve_buffers, Arguments, OwnedAllocations};
use crate::clique::{AcquiredCliques, CollectiveParams};
use crate::engine;
use crate::error::{Error, Result};
use crate::module_cache::ModuleCache;
use crate::output::resolve_outputs;
use crate::plan::ExecutionPlan;
use crate::profile::ExecutionProfile;
use crate::services::RuntimeServices;
use crate::shape::{Shape, ShapeIndex, ShapeTree};
use crate::step::StepContext;
use meridian_device::{DeviceAllocator, DeviceOrdinal, DeviceRegion, DeviceRuntime, StreamHandle, StreamPriority};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Per-call execution options
#[derive(Clone)]
pub struct RunOptions {
    pub device: DeviceOrdinal,
    pub runtime: Arc<dyn DeviceRuntime>,
    pub allocator: Arc<dyn DeviceAllocator>,
    /// Main stream; borrowed from the runtime when absent
    pub stream: Option<StreamHandle>,
    /// Required when the plan contains collectives
    pub collective: Option<CollectiveParams>,
    pub profile: Option<Arc<ExecutionProfile>>,
    /// Hold the device access lock exclusively for the whole call
    pub requires_exclusive_lock: bool,
}

impl RunOptions {
    pub fn new(device: DeviceOrdinal, runtime: Arc<dyn DeviceRuntime>, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            device,
            runtime,
            allocator,
            stream: None,
            collective: None,
            profile: None,
            requires_exclusive_lock: false,
        }
    }

    pub fn with_stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_collective(mut self, collective: CollectiveParams) -> Self {
        self.collective = Some(collective);
        self
    }

    pub fn with_profile(mut self, profile: Arc<ExecutionProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_exclusive_lock(mut self) -> Self {
        self.requires_exclusive_lock = true;
        self
    }
}

/// Result of one execution
///
/// Regions aliased from inputs are listed in [`aliased_indices`](Self::aliased_indices).
/// Positions that still borrow caller memory are never released by
/// [`release`](Self::release).
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    shape: Shape,
    result: ShapeTree<DeviceRegion>,
    aliased: Vec<ShapeIndex>,
    borrowed: Vec<ShapeIndex>,
}

impl ExecutionOutput {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn result(&self) -> &ShapeTree<DeviceRegion> {
        &self.result
    }

    pub fn region(&self, index: &ShapeIndex) -> Option<DeviceRegion> {
        self.result.get(index).copied()
    }

    /// Region at the root position
    pub fn root(&self) -> Option<DeviceRegion> {
        self.result.element().copied()
    }

    pub fn aliased_indices(&self) -> &[ShapeIndex] {
        &self.aliased
    }

    /// Whether the position refers to memory the caller still owns
    pub fn is_borrowed(&self, index: &ShapeIndex) -> bool {
        self.borrowed.contains(index)
    }

    /// Return every region this result owns to `allocator`.
    ///
    /// Every position is attempted; the first failure is reported.
    pub fn release(self, allocator: &dyn DeviceAllocator, device: DeviceOrdinal) -> Result<usize> {
        let mut released = 0;
        let mut failure = None;
        for (index, region) in self.result.iter() {
            if region.is_null() || self.borrowed.contains(index) {
                continue;
            }
            match allocator.deallocate(device, *region) {
                Ok(()) => released += 1,
                Err(err) => {
                    tracing::warn!(%index, %region, error = %err, "failed to release output");
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(released),
        }
    }
}

/// A finalized plan bound to runtime services
pub struct Executable {
    plan: ExecutionPlan,
    services: Arc<RuntimeServices>,
    modules: ModuleCache,
    executions: AtomicU64,
}

impl Executable {
    /// Validate `plan` and bind it to `services`.
    pub fn new(plan: ExecutionPlan, services: Arc<RuntimeServices>) -> Result<Self> {
        plan.validate()?;
        tracing::info!(
            executable = %plan.name,
            steps = plan.steps.len(),
            slots = plan.allocations.len(),
            result = %plan.result_shape,
            "executable created"
        );
        Ok(Self {
            plan,
            services,
            modules: ModuleCache::new(),
            executions: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    /// Completed executions
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Run the plan once.
    ///
    /// Engine-owned temporaries are released on success and failure. On
    /// success, donated inputs that did not become outputs are released too;
    /// on failure they are left untouched.
    #[tracing::instrument(skip_all, fields(executable = %self.plan.name, device = %options.device))]
    pub fn execute(&self, options: &RunOptions, arguments: &Arguments) -> Result<ExecutionOutput> {
        let start = Instant::now();
        let runtime = options.runtime.as_ref();
        let device = options.device;

        let description = runtime.description(device)?;
        self.plan.target.check(&description)?;

        let _access = self
            .services
            .device_locks()
            .acquire(device, options.requires_exclusive_lock);
        let module = self.modules.get_or_load(&self.plan, runtime, device)?;

        let mut owned = OwnedAllocations::new(options.allocator.as_ref(), device);
        let stream = match options.stream {
            Some(stream) => stream,
            None => borrow_streams(runtime, device, 1, StreamPriority::Default)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::failed_precondition(format!("no stream available on {device}")))?,
        };

        let mut table = resolve_buffers(&self.plan.allocations, arguments, &module.constants, &mut owned)?;
        let outputs = resolve_outputs(&self.plan, arguments, &mut table, &mut owned, runtime, stream)?;

        let compute_streams = borrow_streams(runtime, device, self.plan.num_additional_streams(), StreamPriority::Default)?;
        let async_streams = borrow_streams(runtime, device, self.plan.num_async_streams(), StreamPriority::Highest)?;

        let cliques = AcquiredCliques::empty();
        let ctx = StepContext {
            runtime,
            device,
            platform: &description.platform,
            module: module.handle,
            buffers: &table,
            stream,
            compute_streams: &compute_streams,
            async_streams: &async_streams,
            collective: options.collective.as_ref(),
            cliques: &cliques,
            services: &self.services,
            profile: options.profile.as_deref(),
        };
        let run_id = options.collective.as_ref().map(|c| c.run_id.0).unwrap_or_default();
        let barrier_key = format!("{}:run:{run_id}:initialize", self.plan.name);
        let outcome = engine::run_steps(&self.plan.steps, &ctx, &barrier_key);

        if !options.allocator.allows_asynchronous_deallocation() {
            let drained = std::iter::once(&stream)
                .chain(&compute_streams)
                .chain(&async_streams)
                .try_for_each(|s| runtime.block_host_until_done(*s));
            // A step failure takes precedence over a failure to drain
            outcome?;
            drained?;
        } else {
            outcome?;
        }

        let result = outputs.regions(&table);
        let donated = arguments.donated_regions();
        let mut claimed = HashSet::new();
        let mut borrowed = Vec::new();
        for (index, region) in result.iter() {
            if region.is_null() {
                continue;
            }
            let first_use = claimed.insert(region.address());
            let owned_by_result =
                first_use && (owned.take(region.address()) || donated.iter().any(|d| d.address() == region.address()));
            if !owned_by_result {
                borrowed.push(index.clone());
            }
        }

        for region in donated.iter().filter(|d| !claimed.contains(&d.address())) {
            if let Err(err) = options.allocator.deallocate(device, *region) {
                tracing::warn!(%region, error = %err, "failed to release donated input");
            }
        }
        let temporaries = owned.len();
        drop(owned);

        let elapsed = start.elapsed();
        if let Some(profile) = &options.profile {
            profile.record_execution(elapsed);
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            elapsed_us = elapsed.as_micros() as u64,
            temporaries,
            aliased = outputs.aliased_indices().len(),
            copies = outputs.copies(),
            "execution finished"
        );

        Ok(ExecutionOutput {
            shape: self.plan.result_shape.clone(),
            result,
            aliased: outputs.aliased_indices().to_vec(),
            borrowed,
        })
    }
}

fn borrow_streams(
    runtime: &dyn DeviceRuntime,
    device: DeviceOrdinal,
    count: usize,
    priority: StreamPriority,
) -> Result<Vec<StreamHandle>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let streams = runtime.borrow_streams(device, count, priority)?;
    if streams.len() < count {
        tracing::warn!(%device, requested = count, borrowed = streams.len(), ?priority, "stream pool exhausted");
    }
    Ok(streams)
}
