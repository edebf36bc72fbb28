//! Output aliasing
//!
//! Decides, per result position, whether the output reuses a donated input,
//! needs a defensive copy of an input the caller still owns, or is simply
//! the region already bound to its slot.
//!
//! | alias | donated | passthrough / tuple | result                            |
//! |-------|---------|---------------------|-----------------------------------|
//! | none  | -       | -                   | slot region                       |
//! | may   | yes     | -                   | input region, aliased             |
//! | must  | yes     | -                   | input region, aliased             |
//! | must  | no      | -                   | `InvalidArgument`                 |
//! | may   | no      | no                  | fresh copy of input, slot rebound |
//! | may   | no      | yes                 | slot region, aliased              |

use crate::buffer::{Arguments, BufferTable, InputBuffer, OwnedAllocations};
use crate::error::{Error, Result};
use crate::plan::{AliasKind, AliasSource, AllocationSlot, ExecutionPlan, OutputInfo};
use crate::shape::{ShapeIndex, ShapeTree};
use meridian_device::{DeviceError, DeviceRegion, DeviceRuntime, StreamHandle};
use std::collections::HashMap;

/// Result positions bound to slots, plus which of them alias inputs
#[derive(Debug, Clone)]
pub struct ResolvedOutputs {
    slots: ShapeTree<Option<usize>>,
    aliased: Vec<ShapeIndex>,
    copies: usize,
}

impl ResolvedOutputs {
    /// Slot backing a result position
    pub fn slot(&self, index: &ShapeIndex) -> Option<usize> {
        self.slots.get(index).copied().flatten()
    }

    /// Positions that reuse an input buffer
    pub fn aliased_indices(&self) -> &[ShapeIndex] {
        &self.aliased
    }

    /// Defensive copies issued
    pub fn copies(&self) -> usize {
        self.copies
    }

    /// Region of every result position; positions without a slot stay empty.
    pub fn regions(&self, table: &BufferTable) -> ShapeTree<DeviceRegion> {
        self.slots
            .map(|_, slot| slot.and_then(|s| table.regions().get(s).copied()).unwrap_or_default())
    }
}

struct Aliasing<'p> {
    index: &'p ShapeIndex,
    info: &'p OutputInfo,
    slot: &'p AllocationSlot,
    alias: &'p AliasSource,
    input: InputBuffer,
}

/// Apply the aliasing rules for every result position of `plan`.
///
/// Must-alias violations are reported before any copy is issued. Defensive
/// copies are enqueued on `stream` and rebind their slot in `table`.
pub fn resolve_outputs(
    plan: &ExecutionPlan,
    arguments: &Arguments,
    table: &mut BufferTable,
    owned: &mut OwnedAllocations<'_>,
    runtime: &dyn DeviceRuntime,
    stream: StreamHandle,
) -> Result<ResolvedOutputs> {
    let aliasings = collect_aliasings(plan, arguments)?;

    for aliasing in &aliasings {
        if aliasing.alias.kind == AliasKind::MustAlias && !aliasing.input.donated {
            return Err(Error::invalid_argument(format!(
                "output {} must alias parameter {} at {} but that buffer was not donated",
                aliasing.index, aliasing.alias.parameter, aliasing.alias.index
            )));
        }
    }

    let mut aliased = Vec::new();
    let mut copied: HashMap<usize, DeviceRegion> = HashMap::new();
    for aliasing in &aliasings {
        let slot = aliasing.slot;
        let is_tuple = plan
            .result_shape
            .subshape(aliasing.index)
            .is_some_and(|shape| shape.is_tuple());

        if aliasing.input.donated {
            table.set(slot.index, aliasing.input.region)?;
            aliased.push(aliasing.index.clone());
        } else if aliasing.info.passthrough || is_tuple {
            aliased.push(aliasing.index.clone());
        } else if !copied.contains_key(&slot.index) {
            // Copy the caller's buffer, not whatever the slot is bound to.
            let source = if aliasing.input.region.is_null() {
                table.get(slot.index)?
            } else {
                aliasing.input.region
            };
            let fresh = owned.allocate(slot.size, slot.color).map_err(|err| match err {
                DeviceError::OutOfMemory { .. } => Error::ResourceExhausted {
                    requested: slot.size,
                    slot: Some(slot.index),
                    report: None,
                },
                other => other.into(),
            })?;
            let size = source.size().min(fresh.size());
            if size > 0 {
                runtime.copy_device_to_device(stream, fresh, source, size)?;
            }
            table.set(slot.index, fresh)?;
            copied.insert(slot.index, fresh);
            tracing::debug!(output = %aliasing.index, slot = slot.index, %source, %fresh, "copied aliased input");
        }
    }

    let slots = ShapeTree::from_shape(&plan.result_shape, |index, _| {
        plan.outputs.get(index).map(|info| info.allocation_index)
    });
    Ok(ResolvedOutputs {
        slots,
        aliased,
        copies: copied.len(),
    })
}

fn collect_aliasings<'p>(plan: &'p ExecutionPlan, arguments: &Arguments) -> Result<Vec<Aliasing<'p>>> {
    let mut aliasings = Vec::new();
    for (index, info) in &plan.outputs {
        let slot = plan
            .allocations
            .get(info.allocation_index)
            .ok_or_else(|| Error::internal(format!("output {index} refers to missing slot {}", info.allocation_index)))?;
        let Some(alias) = &slot.alias else {
            continue;
        };
        let input = arguments.buffer(alias.parameter, &alias.index).unwrap_or_default();
        aliasings.push(Aliasing {
            index,
            info,
            slot,
            alias,
            input: InputBuffer {
                donated: input.donated && !input.region.is_null(),
                ..input
            },
        });
    }
    Ok(aliasings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ExecutionInput, ShapedBuffer};
    use crate::error::ErrorKind;
    use crate::shape::Shape;
    use meridian_device::host::{HostAllocator, HostDevice};
    use meridian_device::{DeviceOrdinal, ElementType, StreamPriority};

    struct Setup {
        device: HostDevice,
        allocator: HostAllocator,
        input: DeviceRegion,
        stream: StreamHandle,
    }

    fn setup() -> Setup {
        let device = HostDevice::new(1);
        let allocator = HostAllocator::new(device.clone());
        let input = device.allocate_raw(16);
        device.write_from(input, &[1u32, 2, 3, 4]).unwrap();
        let stream = device
            .borrow_streams(DeviceOrdinal(0), 1, StreamPriority::Default)
            .unwrap()[0];
        Setup {
            device,
            allocator,
            input,
            stream,
        }
    }

    fn shape() -> Shape {
        Shape::array(ElementType::U32, [4])
    }

    fn plan(kind: AliasKind, info: OutputInfo) -> ExecutionPlan {
        let slot = AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()).with_alias(0, ShapeIndex::root(), kind);
        ExecutionPlan::new("alias", vec![slot], vec![], shape()).with_output(ShapeIndex::root(), info)
    }

    #[test]
    fn may_alias_without_donation_copies() {
        let s = setup();
        let plan = plan(AliasKind::MayAlias, OutputInfo::new(0));
        let arguments = Arguments::Inputs(vec![ExecutionInput::borrowed(shape(), s.input)]);
        let mut table = BufferTable::new(vec![s.input]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap();
        let result = outputs.regions(&table);
        let region = *result.element().unwrap();

        assert_ne!(region.address(), s.input.address());
        assert_eq!(s.device.read_as::<u32>(region).unwrap(), vec![1, 2, 3, 4]);
        assert!(outputs.aliased_indices().is_empty());
        assert_eq!(outputs.copies(), 1);
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn donated_input_is_reused() {
        let s = setup();
        let plan = plan(AliasKind::MustAlias, OutputInfo::new(0));
        let arguments = Arguments::Inputs(vec![ExecutionInput::donated(shape(), s.input)]);
        let mut table = BufferTable::new(vec![s.input]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap();
        assert_eq!(*outputs.regions(&table).element().unwrap(), s.input);
        assert_eq!(outputs.aliased_indices(), &[ShapeIndex::root()]);
        assert_eq!(s.device.copy_count(), 0);
    }

    #[test]
    fn must_alias_without_donation_is_rejected() {
        let s = setup();
        let plan = plan(AliasKind::MustAlias, OutputInfo::new(0));
        let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(shape(), s.input)]);
        let mut table = BufferTable::new(vec![s.input]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let err = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(s.device.copy_count(), 0);
        assert!(owned.is_empty());
    }

    #[test]
    fn passthrough_keeps_caller_buffer() {
        let s = setup();
        let plan = plan(AliasKind::MayAlias, OutputInfo::passthrough(0));
        let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(shape(), s.input)]);
        let mut table = BufferTable::new(vec![s.input]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap();
        assert_eq!(*outputs.regions(&table).element().unwrap(), s.input);
        assert_eq!(outputs.aliased_indices(), &[ShapeIndex::root()]);
    }

    #[test]
    fn unaliased_output_uses_slot_region() {
        let s = setup();
        let temp = s.device.allocate_raw(16);
        let plan = ExecutionPlan::new("plain", vec![AllocationSlot::live_out(0, 16)], vec![], shape())
            .with_output(ShapeIndex::root(), OutputInfo::new(0));
        let mut table = BufferTable::new(vec![temp]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs =
            resolve_outputs(&plan, &Arguments::none(), &mut table, &mut owned, &s.device, s.stream).unwrap();
        assert_eq!(*outputs.regions(&table).element().unwrap(), temp);
        assert_eq!(outputs.slot(&ShapeIndex::root()), Some(0));
    }

    #[test]
    fn copy_of_aliased_live_out_reads_caller_input() {
        let s = setup();
        let scratch = s.device.allocate_raw(16);
        let plan = ExecutionPlan::new(
            "live_out_alias",
            vec![
                AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()),
                AllocationSlot::live_out(1, 16).with_alias(0, ShapeIndex::root(), AliasKind::MayAlias),
            ],
            vec![],
            shape(),
        )
        .with_output(ShapeIndex::root(), OutputInfo::new(1));
        let arguments = Arguments::Inputs(vec![ExecutionInput::borrowed(shape(), s.input)]);
        let mut table = BufferTable::new(vec![s.input, scratch]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap();
        let region = *outputs.regions(&table).element().unwrap();

        assert_ne!(region, s.input);
        assert_ne!(region, scratch);
        assert_eq!(s.device.read_as::<u32>(region).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(outputs.copies(), 1);
    }

    #[test]
    fn tuple_results_mix_aliased_copied_and_fresh_positions() {
        let s = setup();
        let at = |path: &[usize]| ShapeIndex::new(path.to_vec());
        let parameter_shape = Shape::tuple(vec![Shape::tuple(vec![shape()]), shape()]);
        let result_shape = Shape::tuple(vec![Shape::tuple(vec![shape()]), shape(), shape()]);

        let index_table = s.device.allocate_raw(8);
        let donated = s.device.allocate_raw(16);
        let fresh = s.device.allocate_raw(16);
        let plan = ExecutionPlan::new(
            "tuple",
            vec![
                AllocationSlot::parameter(0, 8, 0, at(&[0])).with_alias(0, at(&[0]), AliasKind::MayAlias),
                AllocationSlot::parameter(1, 16, 0, at(&[0, 0])).with_alias(0, at(&[0, 0]), AliasKind::MayAlias),
                AllocationSlot::live_out(2, 16),
                AllocationSlot::parameter(3, 16, 0, at(&[1])).with_alias(0, at(&[1]), AliasKind::MayAlias),
            ],
            vec![],
            result_shape,
        )
        .with_output(at(&[0]), OutputInfo::new(0))
        .with_output(at(&[0, 0]), OutputInfo::new(1))
        .with_output(at(&[1]), OutputInfo::new(2))
        .with_output(at(&[2]), OutputInfo::new(3));

        let mut input = ExecutionInput::new(parameter_shape);
        input.set_buffer(&at(&[0]), index_table, false).unwrap();
        input.set_buffer(&at(&[0, 0]), donated, true).unwrap();
        input.set_buffer(&at(&[1]), s.input, false).unwrap();
        let arguments = Arguments::Inputs(vec![input]);
        let mut table = BufferTable::new(vec![index_table, donated, fresh, s.input]);
        let mut owned = OwnedAllocations::new(&s.allocator, DeviceOrdinal(0));

        let outputs = resolve_outputs(&plan, &arguments, &mut table, &mut owned, &s.device, s.stream).unwrap();
        let regions = outputs.regions(&table);

        // Tuple node keeps its slot without a copy; the donated leaf is reused.
        assert_eq!(regions.get(&at(&[0])), Some(&index_table));
        assert_eq!(regions.get(&at(&[0, 0])), Some(&donated));
        assert_eq!(regions.get(&at(&[1])), Some(&fresh));
        let copy = *regions.get(&at(&[2])).unwrap();
        assert_ne!(copy, s.input);
        assert_eq!(s.device.read_as::<u32>(copy).unwrap(), vec![1, 2, 3, 4]);

        assert_eq!(outputs.aliased_indices(), &[at(&[0]), at(&[0, 0])]);
        assert_eq!(outputs.copies(), 1);
        assert_eq!(owned.len(), 1);
    }
}
