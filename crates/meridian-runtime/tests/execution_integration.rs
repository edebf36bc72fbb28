//! End-to-end executions on the host backend
//!
//! Covers buffer binding, output aliasing and donation, resource
//! exhaustion, stream plumbing, device locking and the debug options.

use meridian_device::host::{HostAllocator, HostDevice};
use meridian_device::{ComputeCapability, DeviceOrdinal, DeviceRegion, ElementType, LaunchDimensions, ModuleImage};
use meridian_runtime::{
    AliasKind, AllocationSlot, Arguments, BufferSlice, DebugOptions, Error, ErrorKind, Executable, ExecutionInput,
    ExecutionPlan, ExecutionProfile, OutputInfo, RunOptions, RuntimeConfig, RuntimeServices, Shape, ShapeIndex,
    ShapedBuffer, Step, StepKind, TargetRequirement,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEVICE: DeviceOrdinal = DeviceOrdinal(0);

struct Harness {
    device: HostDevice,
    allocator: Arc<HostAllocator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_allocator(HostAllocator::new)
    }

    fn with_allocator(build: impl FnOnce(HostDevice) -> HostAllocator) -> Self {
        meridian_tracing::init_for_tests();
        let device = HostDevice::new(1);
        device.register_kernel("double", |args| {
            let values: Vec<u32> = args.read_as(0)?;
            let doubled: Vec<u32> = values.iter().map(|v| v * 2).collect();
            args.write_from(0, &doubled)
        });
        device.register_kernel("sum_into", |args| {
            let values: Vec<u32> = args.read_as(0)?;
            args.write_from(1, &[values.iter().sum::<u32>()])
        });
        let allocator = Arc::new(build(device.clone()));
        Self { device, allocator }
    }

    fn options(&self) -> RunOptions {
        RunOptions::new(DEVICE, Arc::new(self.device.clone()), self.allocator.clone())
    }

    fn input(&self, values: &[u32]) -> DeviceRegion {
        let region = self.device.allocate_raw(values.len() * 4);
        self.device.write_from(region, values).unwrap();
        region
    }

    /// Input owned by the allocator, so the engine may release it
    fn allocated_input(&self, values: &[u32]) -> DeviceRegion {
        use meridian_device::{DeviceAllocator, MemorySpace};
        let region = self
            .allocator
            .allocate(DEVICE, values.len() * 4, false, MemorySpace::DEFAULT)
            .unwrap();
        self.device.write_from(region, values).unwrap();
        region
    }
}

fn u32s(n: usize) -> Shape {
    Shape::array(ElementType::U32, [n])
}

fn services() -> Arc<RuntimeServices> {
    RuntimeServices::new(RuntimeConfig::default())
}

fn double_step(slot: usize) -> Step {
    Step::kernel(
        "double",
        "double",
        vec![BufferSlice::new(slot, 0, 16)],
        LaunchDimensions::linear(1, 4),
    )
}

/// Parameter 0 aliased into the result; the kernel doubles it in place.
fn aliased_plan(kind: AliasKind, steps: Vec<Step>) -> ExecutionPlan {
    ExecutionPlan::new(
        "aliased",
        vec![AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()).with_alias(0, ShapeIndex::root(), kind)],
        steps,
        u32s(4),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(0))
}

#[test]
fn may_alias_without_donation_copies_input() {
    let h = Harness::new();
    let input = h.input(&[1, 2, 3, 4]);
    let sum = Step::kernel(
        "sum",
        "sum_into",
        vec![BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 4)],
        LaunchDimensions::linear(1, 1),
    );
    let plan = ExecutionPlan::new(
        "scenario_a",
        vec![
            AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()).with_alias(0, ShapeIndex::root(), AliasKind::MayAlias),
            AllocationSlot::temp(1, 4),
        ],
        vec![sum],
        u32s(4),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(0));
    let executable = Executable::new(plan, services()).unwrap();

    let arguments = Arguments::Inputs(vec![ExecutionInput::borrowed(u32s(4), input)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();
    let region = output.root().unwrap();

    assert_ne!(region.address(), input.address());
    assert_eq!(h.device.read_as::<u32>(region).unwrap(), vec![1, 2, 3, 4]);
    assert!(output.aliased_indices().is_empty());

    output.release(h.allocator.as_ref(), DEVICE).unwrap();
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn defensive_copy_protects_caller_input() {
    let h = Harness::new();
    let input = h.input(&[1, 2, 3, 4]);
    let executable = Executable::new(aliased_plan(AliasKind::MayAlias, vec![double_step(0)]), services()).unwrap();

    let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(u32s(4), input)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();

    assert_eq!(h.device.read_as::<u32>(output.root().unwrap()).unwrap(), vec![2, 4, 6, 8]);
    assert_eq!(h.device.read_as::<u32>(input).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn donated_input_is_updated_in_place() {
    let h = Harness::new();
    let input = h.allocated_input(&[1, 2, 3, 4]);
    let executable = Executable::new(aliased_plan(AliasKind::MustAlias, vec![double_step(0)]), services()).unwrap();

    let arguments = Arguments::Inputs(vec![ExecutionInput::donated(u32s(4), input)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();

    assert_eq!(output.root(), Some(input));
    assert_eq!(output.aliased_indices(), &[ShapeIndex::root()]);
    assert!(!output.is_borrowed(&ShapeIndex::root()));
    assert_eq!(h.device.read_as::<u32>(input).unwrap(), vec![2, 4, 6, 8]);

    assert_eq!(output.release(h.allocator.as_ref(), DEVICE).unwrap(), 1);
    assert_eq!(h.allocator.live_allocations(), 0);
}

/// Live-out slot declared as aliasing parameter 0, with no steps
fn live_out_alias_plan() -> ExecutionPlan {
    ExecutionPlan::new(
        "live_out_alias",
        vec![
            AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()),
            AllocationSlot::live_out(1, 16).with_alias(0, ShapeIndex::root(), AliasKind::MayAlias),
        ],
        vec![],
        u32s(4),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(1))
}

#[test]
fn aliased_live_out_returns_input_contents_with_or_without_donation() {
    let h = Harness::new();
    let executable = Executable::new(live_out_alias_plan(), services()).unwrap();

    let borrowed = h.input(&[1, 2, 3, 4]);
    let arguments = Arguments::Inputs(vec![ExecutionInput::borrowed(u32s(4), borrowed)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();
    let region = output.root().unwrap();
    assert_ne!(region.address(), borrowed.address());
    assert_eq!(h.device.read_as::<u32>(region).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(output.release(h.allocator.as_ref(), DEVICE).unwrap(), 1);

    let donated = h.allocated_input(&[1, 2, 3, 4]);
    let arguments = Arguments::Inputs(vec![ExecutionInput::donated(u32s(4), donated)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();
    assert_eq!(output.root(), Some(donated));
    assert_eq!(h.device.read_as::<u32>(donated).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(output.release(h.allocator.as_ref(), DEVICE).unwrap(), 1);
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn tuple_result_with_donated_and_fresh_leaves() {
    let h = Harness::new();
    let input = h.allocated_input(&[1, 2, 3, 4]);
    let sum = Step::kernel(
        "sum",
        "sum_into",
        vec![BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 4)],
        LaunchDimensions::linear(1, 1),
    );
    let plan = ExecutionPlan::new(
        "pair",
        vec![
            AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()).with_alias(0, ShapeIndex::root(), AliasKind::MayAlias),
            AllocationSlot::live_out(1, 4),
        ],
        vec![double_step(0), sum],
        Shape::tuple(vec![u32s(4), u32s(1)]),
    )
    .with_output(ShapeIndex::new([0]), OutputInfo::new(0))
    .with_output(ShapeIndex::new([1]), OutputInfo::new(1));
    let executable = Executable::new(plan, services()).unwrap();

    let arguments = Arguments::Inputs(vec![ExecutionInput::donated(u32s(4), input)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();

    assert_eq!(output.root(), Some(DeviceRegion::empty()));
    assert_eq!(output.region(&ShapeIndex::new([0])), Some(input));
    assert_eq!(h.device.read_as::<u32>(input).unwrap(), vec![2, 4, 6, 8]);
    let total = output.region(&ShapeIndex::new([1])).unwrap();
    assert_eq!(h.device.read_as::<u32>(total).unwrap(), vec![20]);
    assert_eq!(output.aliased_indices(), &[ShapeIndex::new([0])]);
    assert!(!output.is_borrowed(&ShapeIndex::new([0])));
    assert!(!output.is_borrowed(&ShapeIndex::new([1])));

    assert_eq!(output.release(h.allocator.as_ref(), DEVICE).unwrap(), 2);
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn must_alias_without_donation_runs_nothing() {
    let h = Harness::new();
    let input = h.input(&[1, 2, 3, 4]);
    let executable = Executable::new(aliased_plan(AliasKind::MustAlias, vec![double_step(0)]), services()).unwrap();

    let arguments = Arguments::Inputs(vec![ExecutionInput::borrowed(u32s(4), input)]);
    let err = executable.execute(&h.options(), &arguments).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(h.device.launch_count(), 0);
    assert_eq!(h.device.copy_count(), 0);
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn unused_donation_is_released_after_success() {
    let h = Harness::new();
    let input = h.allocated_input(&[5, 6, 7, 8]);
    let plan = ExecutionPlan::new(
        "consume",
        vec![
            AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()),
            AllocationSlot::live_out(1, 4),
        ],
        vec![Step::kernel(
            "sum",
            "sum_into",
            vec![BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 4)],
            LaunchDimensions::linear(1, 1),
        )],
        Shape::scalar(ElementType::U32),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(1));
    let executable = Executable::new(plan, services()).unwrap();

    let arguments = Arguments::Inputs(vec![ExecutionInput::donated(u32s(4), input)]);
    let output = executable.execute(&h.options(), &arguments).unwrap();

    assert_eq!(h.device.read_as::<u32>(output.root().unwrap()).unwrap(), vec![26]);
    assert!(!h.allocator.owns(input.address()));
    assert_eq!(h.allocator.live_allocations(), 1);
}

#[test]
fn thread_local_slots_stay_empty() {
    let h = Harness::with_allocator(|device| HostAllocator::new(device).with_capacity(0));
    let plan = ExecutionPlan::new(
        "thread_local",
        vec![AllocationSlot::thread_local(0, 1 << 20)],
        vec![],
        Shape::tuple(vec![]),
    );
    let executable = Executable::new(plan, services()).unwrap();

    executable.execute(&h.options(), &Arguments::none()).unwrap();
    assert_eq!(h.allocator.allocation_count(), 0);
}

#[test]
fn exhaustion_reports_slot_and_releases_temporaries() {
    let h = Harness::with_allocator(|device| HostAllocator::new(device).with_capacity(64));
    let plan = ExecutionPlan::new(
        "scenario_d",
        vec![AllocationSlot::temp(0, 32), AllocationSlot::temp(1, 4096)],
        vec![double_step(0)],
        Shape::tuple(vec![]),
    );
    let executable = Executable::new(plan, services()).unwrap();

    let err = executable.execute(&h.options(), &Arguments::none()).unwrap_err();
    let Error::ResourceExhausted { requested, slot, report } = &err else {
        panic!("expected resource exhaustion, got {err:?}");
    };
    assert_eq!(*requested, 4096);
    assert_eq!(*slot, Some(1));
    let report = report.as_deref().unwrap();
    assert!(report.contains("slot 0: temp 32 bytes"), "{report}");
    assert!(report.contains("slot 1: temp 4096 bytes"), "{report}");
    assert!(report.contains("allocation failed"), "{report}");

    assert_eq!(h.device.launch_count(), 0);
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn unbound_parameter_is_invalid_argument() {
    let h = Harness::new();
    let executable = Executable::new(aliased_plan(AliasKind::MayAlias, vec![]), services()).unwrap();
    let err = executable.execute(&h.options(), &Arguments::none()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("unbound parameter"), "{err}");
}

#[test]
fn repeated_runs_are_bit_identical() {
    let h = Harness::new();
    let executable = Executable::new(aliased_plan(AliasKind::MayAlias, vec![double_step(0)]), services()).unwrap();

    let mut results = Vec::new();
    for _ in 0..2 {
        let input = h.input(&[3, 1, 4, 1]);
        let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(u32s(4), input)]);
        let output = executable.execute(&h.options(), &arguments).unwrap();
        results.push(h.device.read(output.root().unwrap()).unwrap());
        output.release(h.allocator.as_ref(), DEVICE).unwrap();
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(executable.executions(), 2);
}

#[test]
fn module_and_constants_load_once() {
    let h = Harness::new();
    let plan = ExecutionPlan::new(
        "constants",
        vec![AllocationSlot::constant(0, 16), AllocationSlot::live_out(1, 16)],
        vec![Step::copy("copy", BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 16))],
        u32s(4),
    )
    .with_module(ModuleImage::new("constants").with_global("table", 16))
    .with_constant("table", 0, Some(bytemuck::cast_slice(&[9u32, 8, 7, 6]).to_vec()))
    .with_output(ShapeIndex::root(), OutputInfo::new(1));
    let executable = Executable::new(plan, services()).unwrap();

    for _ in 0..3 {
        let output = executable.execute(&h.options(), &Arguments::none()).unwrap();
        assert_eq!(h.device.read_as::<u32>(output.root().unwrap()).unwrap(), vec![9, 8, 7, 6]);
        output.release(h.allocator.as_ref(), DEVICE).unwrap();
    }
    assert_eq!(h.device.modules_loaded(), 1);
    assert_eq!(executable.modules().len(), 1);
}

#[test]
fn target_mismatch_fails_before_loading() {
    let h = Harness::new();
    let plan = ExecutionPlan::new("gpu_only", vec![], vec![], Shape::tuple(vec![])).with_target(TargetRequirement {
        platform: Some(HostDevice::PLATFORM.to_string()),
        min_compute_capability: Some(ComputeCapability::new(9, 0)),
    });
    let executable = Executable::new(plan, services()).unwrap();

    let err = executable.execute(&h.options(), &Arguments::none()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(h.device.modules_loaded(), 0);
}

#[test]
fn missing_execution_stream_is_fatal() {
    let h = Harness::new();
    let main = {
        use meridian_device::{DeviceRuntime, StreamPriority};
        h.device.borrow_streams(DEVICE, 1, StreamPriority::Default).unwrap()[0]
    };
    h.device.set_stream_limit(Some(1));
    let plan = ExecutionPlan::new(
        "streams",
        vec![AllocationSlot::temp(0, 16)],
        vec![Step::memset("fill", BufferSlice::new(0, 0, 16), 1).on_stream(2)],
        Shape::tuple(vec![]),
    );
    let executable = Executable::new(plan, services()).unwrap();

    let err = executable
        .execute(&h.options().with_stream(main), &Arguments::none())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(h.allocator.live_allocations(), 0);
}

#[test]
fn steps_run_on_additional_streams() {
    let h = Harness::new();
    let plan = ExecutionPlan::new(
        "streams",
        vec![AllocationSlot::live_out(0, 16)],
        vec![
            Step::memset("fill", BufferSlice::new(0, 0, 16), 0).on_stream(1),
            Step::memset("fill_half", BufferSlice::new(0, 0, 8), 0xff).on_stream(2),
        ],
        u32s(4),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(0));
    let executable = Executable::new(plan, services()).unwrap();
    assert_eq!(executable.plan().num_additional_streams(), 2);

    let output = executable.execute(&h.options(), &Arguments::none()).unwrap();
    assert_eq!(
        h.device.read_as::<u32>(output.root().unwrap()).unwrap(),
        vec![u32::MAX, u32::MAX, 0, 0]
    );
}

#[test]
fn exclusive_runs_wait_for_device_lock() {
    let h = Harness::new();
    let services = services();
    let executable = Executable::new(
        ExecutionPlan::new("noop", vec![], vec![], Shape::tuple(vec![])),
        Arc::clone(&services),
    )
    .unwrap();

    let held = services.device_locks().acquire(DEVICE, false);
    thread::scope(|scope| {
        let run = scope.spawn(|| {
            executable
                .execute(&h.options().with_exclusive_lock(), &Arguments::none())
                .unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(executable.executions(), 0);
        drop(held);
        run.join().unwrap();
    });
    assert_eq!(executable.executions(), 1);
}

#[test]
fn deterministic_mode_rejects_nondeterministic_steps() {
    let h = Harness::new();
    let debug = DebugOptions {
        deterministic_ops: true,
        ..DebugOptions::default()
    };
    let services = RuntimeServices::new(RuntimeConfig::default().with_debug(debug));
    let plan = ExecutionPlan::new(
        "scatter",
        vec![AllocationSlot::temp(0, 16)],
        vec![double_step(0), double_step(0).nondeterministic()],
        Shape::tuple(vec![]),
    );
    let executable = Executable::new(plan, services).unwrap();

    let err = executable.execute(&h.options(), &Arguments::none()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(h.device.launch_count(), 0);
}

#[test]
fn unregistered_custom_call_depends_on_mock_option() {
    let h = Harness::new();
    let plan = || {
        ExecutionPlan::new(
            "custom",
            vec![AllocationSlot::temp(0, 16)],
            vec![Step::custom_call("call", "vendor_fused_op", vec![], vec![BufferSlice::new(0, 0, 16)])],
            Shape::tuple(vec![]),
        )
    };

    let strict = Executable::new(plan(), services()).unwrap();
    let err = strict.execute(&h.options(), &Arguments::none()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unimplemented);

    let debug = DebugOptions {
        mock_unimplemented_custom_calls: true,
        ..DebugOptions::default()
    };
    let mocked = Executable::new(plan(), RuntimeServices::new(RuntimeConfig::default().with_debug(debug))).unwrap();
    mocked.execute(&h.options(), &Arguments::none()).unwrap();
}

#[test]
fn command_buffer_records_once_across_runs() {
    let h = Harness::new();
    let plan = ExecutionPlan::new(
        "graph",
        vec![AllocationSlot::live_out(0, 16)],
        vec![
            Step::memset("init", BufferSlice::new(0, 0, 16), 0),
            Step::command_buffer("graph", vec![double_step(0), double_step(0)]),
        ],
        u32s(4),
    )
    .with_output(ShapeIndex::root(), OutputInfo::new(0));
    let executable = Executable::new(plan, services()).unwrap();

    for _ in 0..3 {
        let output = executable.execute(&h.options(), &Arguments::none()).unwrap();
        output.release(h.allocator.as_ref(), DEVICE).unwrap();
    }

    let StepKind::CommandBuffer(graph) = &executable.plan().steps[1].kind else {
        panic!("expected a command buffer");
    };
    assert_eq!(graph.recordings(), 1);
    assert_eq!(h.device.launches_of("double"), 6);
}

#[test]
fn profile_accumulates_across_runs() {
    let h = Harness::new();
    let profile = Arc::new(ExecutionProfile::new());
    let plan = ExecutionPlan::new(
        "profiled",
        vec![AllocationSlot::temp(0, 16)],
        vec![double_step(0)],
        Shape::tuple(vec![]),
    );
    let executable = Executable::new(plan, services()).unwrap();
    let options = h.options().with_profile(Arc::clone(&profile));

    executable.execute(&options, &Arguments::none()).unwrap();
    executable.execute(&options, &Arguments::none()).unwrap();

    let snapshot = profile.snapshot();
    assert_eq!(snapshot.executions, 2);
    assert_eq!(snapshot.steps["double"].count, 2);
    assert!(snapshot.phases.contains_key("execute"));
}

#[test]
fn invalid_plan_is_rejected() {
    let plan = ExecutionPlan::new(
        "broken",
        vec![AllocationSlot::temp(0, 8)],
        vec![double_step(0)],
        Shape::tuple(vec![]),
    );
    let err = Executable::new(plan, services()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Internal);
}
