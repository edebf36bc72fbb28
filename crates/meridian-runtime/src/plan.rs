//! Finalized execution plans
//!
//! An [`ExecutionPlan`] is produced by lowering and never mutated while it
//! runs. It pairs the ordered steps with the allocation slots they address
//! and describes how result positions map onto those slots.

use crate::error::{Error, Result};
use crate::shape::{Shape, ShapeIndex};
use crate::step::{Step, StepKind};
use meridian_device::{ComputeCapability, DeviceDescription, MemorySpace, ModuleImage};
use std::collections::BTreeMap;
use std::fmt;

/// Alignment required of entry parameter regions
pub const ENTRY_PARAMETER_ALIGNMENT: u64 = 64;
/// Alignment required of constant regions
pub const CONSTANT_ALIGNMENT: u64 = 64;
/// Alignment required of engine-allocated regions
pub const TEMP_ALIGNMENT: u64 = 16;

/// Where an entry parameter slot finds its buffer in the arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLocator {
    pub parameter: usize,
    pub index: ShapeIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    /// Reuse the input when donated, otherwise copy
    MayAlias,
    /// The input must be donated
    MustAlias,
}

/// Input buffer an output slot may reuse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasSource {
    pub parameter: usize,
    pub index: ShapeIndex,
    pub kind: AliasKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    ThreadLocal,
    Parameter,
    Constant,
    LiveOut,
    Temp,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::ThreadLocal => "thread_local",
            SlotKind::Parameter => "parameter",
            SlotKind::Constant => "constant",
            SlotKind::LiveOut => "live_out",
            SlotKind::Temp => "temp",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical buffer of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSlot {
    pub index: usize,
    pub size: usize,
    pub color: MemorySpace,
    pub parameter: Option<ParameterLocator>,
    pub is_constant: bool,
    pub maybe_live_out: bool,
    pub is_temp: bool,
    pub is_thread_local: bool,
    pub alias: Option<AliasSource>,
}

impl AllocationSlot {
    fn base(index: usize, size: usize) -> Self {
        Self {
            index,
            size,
            color: MemorySpace::DEFAULT,
            parameter: None,
            is_constant: false,
            maybe_live_out: false,
            is_temp: false,
            is_thread_local: false,
            alias: None,
        }
    }

    /// Scratch buffer released at the end of every execution
    pub fn temp(index: usize, size: usize) -> Self {
        Self {
            is_temp: true,
            ..Self::base(index, size)
        }
    }

    /// Engine-allocated buffer that may become part of the result
    pub fn live_out(index: usize, size: usize) -> Self {
        Self {
            maybe_live_out: true,
            ..Self::base(index, size)
        }
    }

    pub fn parameter(index: usize, size: usize, parameter: usize, shape_index: ShapeIndex) -> Self {
        Self {
            parameter: Some(ParameterLocator {
                parameter,
                index: shape_index,
            }),
            ..Self::base(index, size)
        }
    }

    pub fn constant(index: usize, size: usize) -> Self {
        Self {
            is_constant: true,
            ..Self::base(index, size)
        }
    }

    pub fn thread_local(index: usize, size: usize) -> Self {
        Self {
            is_thread_local: true,
            ..Self::base(index, size)
        }
    }

    pub fn with_color(mut self, color: MemorySpace) -> Self {
        self.color = color;
        self
    }

    pub fn with_maybe_live_out(mut self) -> Self {
        self.maybe_live_out = true;
        self
    }

    /// Declare that the output using this slot may reuse an input buffer.
    pub fn with_alias(mut self, parameter: usize, index: ShapeIndex, kind: AliasKind) -> Self {
        self.maybe_live_out = true;
        self.alias = Some(AliasSource { parameter, index, kind });
        self
    }

    pub fn kind(&self) -> SlotKind {
        if self.is_thread_local {
            SlotKind::ThreadLocal
        } else if self.parameter.is_some() {
            SlotKind::Parameter
        } else if self.is_constant {
            SlotKind::Constant
        } else if self.maybe_live_out {
            SlotKind::LiveOut
        } else {
            SlotKind::Temp
        }
    }

    pub fn required_alignment(&self) -> u64 {
        match self.kind() {
            SlotKind::Parameter => ENTRY_PARAMETER_ALIGNMENT,
            SlotKind::Constant => CONSTANT_ALIGNMENT,
            SlotKind::ThreadLocal | SlotKind::LiveOut | SlotKind::Temp => TEMP_ALIGNMENT,
        }
    }
}

/// How a result position is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputInfo {
    pub allocation_index: usize,
    /// The output is an entry parameter returned unchanged
    pub passthrough: bool,
}

impl OutputInfo {
    pub fn new(allocation_index: usize) -> Self {
        Self {
            allocation_index,
            passthrough: false,
        }
    }

    pub fn passthrough(allocation_index: usize) -> Self {
        Self {
            allocation_index,
            passthrough: true,
        }
    }
}

/// A module global that backs a constant slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantInfo {
    pub symbol: String,
    pub allocation_index: usize,
    /// Host bytes uploaded once when the module is loaded
    pub content: Option<Vec<u8>>,
}

/// Devices a plan was compiled for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRequirement {
    pub platform: Option<String>,
    pub min_compute_capability: Option<ComputeCapability>,
}

impl TargetRequirement {
    pub fn check(&self, description: &DeviceDescription) -> Result<()> {
        if let Some(platform) = &self.platform {
            if *platform != description.platform {
                return Err(Error::failed_precondition(format!(
                    "plan targets platform {platform} but {} is a {} device",
                    description.ordinal, description.platform
                )));
            }
        }
        if let Some(required) = self.min_compute_capability {
            if description.compute_capability < required {
                return Err(Error::failed_precondition(format!(
                    "plan requires compute capability {required} but {} has {}",
                    description.ordinal, description.compute_capability
                )));
            }
        }
        Ok(())
    }
}

/// A finalized, immutable program ready to execute
#[derive(Debug)]
pub struct ExecutionPlan {
    pub name: String,
    pub steps: Vec<Step>,
    pub allocations: Vec<AllocationSlot>,
    pub result_shape: Shape,
    pub outputs: BTreeMap<ShapeIndex, OutputInfo>,
    pub constants: Vec<ConstantInfo>,
    pub module: ModuleImage,
    pub target: TargetRequirement,
}

impl ExecutionPlan {
    pub fn new(
        name: impl Into<String>,
        allocations: Vec<AllocationSlot>,
        steps: Vec<Step>,
        result_shape: Shape,
    ) -> Self {
        let name = name.into();
        Self {
            module: ModuleImage::new(name.clone()),
            name,
            steps,
            allocations,
            result_shape,
            outputs: BTreeMap::new(),
            constants: Vec::new(),
            target: TargetRequirement::default(),
        }
    }

    pub fn with_output(mut self, index: ShapeIndex, info: OutputInfo) -> Self {
        self.outputs.insert(index, info);
        self
    }

    /// Declare that `symbol` in the module backs constant slot `allocation_index`.
    pub fn with_constant(mut self, symbol: impl Into<String>, allocation_index: usize, content: Option<Vec<u8>>) -> Self {
        self.constants.push(ConstantInfo {
            symbol: symbol.into(),
            allocation_index,
            content,
        });
        self
    }

    pub fn with_module(mut self, module: ModuleImage) -> Self {
        self.module = module;
        self
    }

    pub fn with_target(mut self, target: TargetRequirement) -> Self {
        self.target = target;
        self
    }

    /// Execution streams needed beyond the main stream
    pub fn num_additional_streams(&self) -> usize {
        let mut max = 0;
        for step in &self.steps {
            step.visit(&mut |s| max = max.max(s.info.execution_stream));
        }
        max
    }

    /// Streams needed for asynchronous collectives
    pub fn num_async_streams(&self) -> usize {
        let mut count = 0;
        for step in &self.steps {
            step.visit(&mut |s| {
                if let StepKind::Collective(collective) = &s.kind {
                    if let Some(stream) = collective.async_stream {
                        count = count.max(stream + 1);
                    }
                }
            });
        }
        count
    }

    /// Check internal consistency; failures indicate a lowering bug.
    pub fn validate(&self) -> Result<()> {
        for (position, slot) in self.allocations.iter().enumerate() {
            if slot.index != position {
                return Err(Error::internal(format!(
                    "allocation slot at position {position} has index {}",
                    slot.index
                )));
            }
        }

        let slot = |index: usize, what: &str| {
            self.allocations
                .get(index)
                .ok_or_else(|| Error::internal(format!("{what} refers to missing allocation slot {index}")))
        };

        for (index, info) in &self.outputs {
            if self.result_shape.subshape(index).is_none() {
                return Err(Error::internal(format!(
                    "output {index} is not a position of result shape {}",
                    self.result_shape
                )));
            }
            slot(info.allocation_index, &format!("output {index}"))?;
        }
        for index in self.result_shape.indices() {
            let is_leaf = self.result_shape.subshape(&index).is_some_and(|s| !s.is_tuple());
            if is_leaf && !self.outputs.contains_key(&index) {
                return Err(Error::internal(format!("result leaf {index} has no output slot")));
            }
        }

        for constant in &self.constants {
            let slot = slot(constant.allocation_index, &format!("constant {}", constant.symbol))?;
            if !slot.is_constant {
                return Err(Error::internal(format!(
                    "constant {} is bound to non-constant slot {}",
                    constant.symbol, slot.index
                )));
            }
        }

        let mut failure = None;
        for step in &self.steps {
            step.visit(&mut |s| {
                if failure.is_some() {
                    return;
                }
                for buffer in s.kind.buffer_slices() {
                    match self.allocations.get(buffer.allocation) {
                        None => {
                            failure = Some(Error::internal(format!(
                                "step {} uses missing allocation slot {}",
                                s.info.annotation, buffer.allocation
                            )))
                        }
                        Some(slot) if buffer.offset.checked_add(buffer.size).map_or(true, |end| end > slot.size) => {
                            failure = Some(Error::internal(format!(
                                "step {} slice {buffer} overruns slot {} of {} bytes",
                                s.info.annotation, slot.index, slot.size
                            )))
                        }
                        Some(_) => {}
                    }
                }
            });
        }
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferSlice;
    use crate::error::ErrorKind;
    use meridian_device::{DeviceOrdinal, ElementType};

    fn f32x4() -> Shape {
        Shape::array(ElementType::F32, [4])
    }

    #[test]
    fn slot_kinds_and_alignment() {
        let param = AllocationSlot::parameter(0, 16, 0, ShapeIndex::root());
        assert_eq!(param.kind(), SlotKind::Parameter);
        assert_eq!(param.required_alignment(), ENTRY_PARAMETER_ALIGNMENT);

        let aliased = AllocationSlot::parameter(1, 16, 0, ShapeIndex::root()).with_alias(
            0,
            ShapeIndex::root(),
            AliasKind::MayAlias,
        );
        assert!(aliased.maybe_live_out);
        assert_eq!(aliased.kind(), SlotKind::Parameter);

        assert_eq!(AllocationSlot::temp(2, 8).required_alignment(), TEMP_ALIGNMENT);
        assert_eq!(AllocationSlot::thread_local(3, 8).kind(), SlotKind::ThreadLocal);
        assert_eq!(AllocationSlot::live_out(4, 8).kind(), SlotKind::LiveOut);
    }

    #[test]
    fn target_requirement_checks_platform_and_capability() {
        let description = DeviceDescription {
            platform: "host".into(),
            ordinal: DeviceOrdinal(0),
            compute_capability: ComputeCapability::new(7, 5),
        };
        let ok = TargetRequirement {
            platform: Some("host".into()),
            min_compute_capability: Some(ComputeCapability::new(7, 0)),
        };
        assert!(ok.check(&description).is_ok());

        let too_new = TargetRequirement {
            platform: None,
            min_compute_capability: Some(ComputeCapability::new(8, 0)),
        };
        assert_eq!(too_new.check(&description).unwrap_err().kind(), ErrorKind::FailedPrecondition);

        let wrong_platform = TargetRequirement {
            platform: Some("cuda".into()),
            min_compute_capability: None,
        };
        assert!(wrong_platform.check(&description).is_err());
    }

    #[test]
    fn validate_catches_missing_outputs_and_overruns() {
        let slots = vec![AllocationSlot::live_out(0, 16)];
        let plan = ExecutionPlan::new("p", slots.clone(), vec![], f32x4());
        assert!(plan.validate().is_err());

        let plan = ExecutionPlan::new("p", slots.clone(), vec![], f32x4())
            .with_output(ShapeIndex::root(), OutputInfo::new(0));
        assert!(plan.validate().is_ok());

        let overrun = Step::memset("zero", BufferSlice::new(0, 8, 16), 0);
        let plan = ExecutionPlan::new("p", slots, vec![overrun], f32x4())
            .with_output(ShapeIndex::root(), OutputInfo::new(0));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn validate_rejects_slice_offset_overflow() {
        let slots = vec![AllocationSlot::live_out(0, 16)];
        let huge = Step::memset("m", BufferSlice::new(0, usize::MAX, 1), 0);
        let plan = ExecutionPlan::new("p", slots, vec![huge], f32x4())
            .with_output(ShapeIndex::root(), OutputInfo::new(0));

        let err = plan.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("overruns"), "{err}");
    }

    #[test]
    fn stream_counts_include_nested_steps() {
        let slots = vec![AllocationSlot::live_out(0, 16)];
        let nested = Step::sequential("body", vec![Step::memset("m", BufferSlice::new(0, 0, 16), 1).on_stream(2)]);
        let plan = ExecutionPlan::new("p", slots, vec![nested], f32x4());
        assert_eq!(plan.num_additional_streams(), 2);
        assert_eq!(plan.num_async_streams(), 0);
    }
}
