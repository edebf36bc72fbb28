use super::{Arguments, BufferTable, OwnedAllocations};
use crate::error::{Error, Result};
use crate::plan::{AllocationSlot, SlotKind};
use meridian_device::{DeviceError, DeviceRegion};
use std::collections::HashMap;
use std::fmt::Write;

/// Bind every allocation slot to a concrete region, in slot order.
///
/// - thread-local slots stay empty
/// - parameters come from the caller's arguments
/// - constants come from `constants`; missing ones stay empty
/// - everything else is allocated through `owned`
pub fn resolve_buffers(
    allocations: &[AllocationSlot],
    arguments: &Arguments,
    constants: &HashMap<usize, DeviceRegion>,
    owned: &mut OwnedAllocations<'_>,
) -> Result<BufferTable> {
    let mut regions = Vec::with_capacity(allocations.len());

    for slot in allocations {
        let kind = slot.kind();
        let region = match kind {
            SlotKind::ThreadLocal => DeviceRegion::empty(),
            SlotKind::Parameter => resolve_parameter(slot, arguments)?,
            SlotKind::Constant => constants.get(&slot.index).copied().unwrap_or_default(),
            SlotKind::LiveOut | SlotKind::Temp => match owned.allocate(slot.size, slot.color) {
                Ok(region) => {
                    meridian_tracing::performance::record_allocation(slot.index, slot.size, kind.as_str(), slot.color.0);
                    region
                }
                Err(DeviceError::OutOfMemory { .. }) => {
                    return Err(Error::ResourceExhausted {
                        requested: slot.size,
                        slot: Some(slot.index),
                        report: Some(allocation_report(allocations, &regions, slot, owned.bytes())),
                    });
                }
                Err(err) => return Err(err.into()),
            },
        };

        if !region.is_null() && !region.is_aligned(slot.required_alignment()) {
            return Err(Error::internal(format!(
                "{kind} slot {} bound to {region}, which is not {}-byte aligned",
                slot.index,
                slot.required_alignment()
            )));
        }
        regions.push(region);
    }

    tracing::debug!(slots = regions.len(), engine_bytes = owned.bytes(), "buffers resolved");
    Ok(BufferTable::new(regions))
}

fn resolve_parameter(slot: &AllocationSlot, arguments: &Arguments) -> Result<DeviceRegion> {
    let Some(locator) = &slot.parameter else {
        return Err(Error::internal(format!("slot {} is not a parameter", slot.index)));
    };
    let region = arguments
        .buffer(locator.parameter, &locator.index)
        .map(|buffer| buffer.region)
        .unwrap_or_default();
    if slot.size > 0 && (region.is_null() || region.size() == 0) {
        return Err(Error::invalid_argument(format!(
            "unbound parameter {} at {} for slot {} ({} bytes expected)",
            locator.parameter, locator.index, slot.index, slot.size
        )));
    }
    Ok(region)
}

/// Listing of every slot resolved before an allocation failed
fn allocation_report(
    allocations: &[AllocationSlot],
    resolved: &[DeviceRegion],
    failed: &AllocationSlot,
    engine_bytes: usize,
) -> String {
    let mut report = format!(
        "allocation report: {} of {} slots resolved, {engine_bytes} bytes allocated by this execution",
        resolved.len(),
        allocations.len()
    );
    for (slot, region) in allocations.iter().zip(resolved) {
        let _ = write!(
            report,
            "\n  slot {}: {} {} bytes, memory space {} -> {region}",
            slot.index,
            slot.kind(),
            slot.size,
            slot.color.0
        );
    }
    let _ = write!(
        report,
        "\n  slot {}: {} {} bytes, memory space {} -> allocation failed",
        failed.index,
        failed.kind(),
        failed.size,
        failed.color.0
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ExecutionInput, ShapedBuffer};
    use crate::error::ErrorKind;
    use crate::shape::{Shape, ShapeIndex};
    use meridian_device::host::{HostAllocator, HostDevice};
    use meridian_device::{DeviceOrdinal, ElementType};

    fn f32s(n: usize) -> Shape {
        Shape::array(ElementType::F32, [n])
    }

    #[test]
    fn each_slot_kind_resolves() {
        let device = HostDevice::new(1);
        let allocator = HostAllocator::new(device.clone());
        let input = device.allocate_raw(16);
        let constant = device.allocate_raw(8);

        let slots = vec![
            AllocationSlot::parameter(0, 16, 0, ShapeIndex::root()),
            AllocationSlot::constant(1, 8),
            AllocationSlot::constant(2, 8),
            AllocationSlot::thread_local(3, 32),
            AllocationSlot::temp(4, 24),
        ];
        let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(f32s(4), input)]);
        let constants = HashMap::from([(1, constant)]);

        let mut owned = OwnedAllocations::new(&allocator, DeviceOrdinal(0));
        let table = resolve_buffers(&slots, &arguments, &constants, &mut owned).unwrap();

        assert_eq!(table.get(0).unwrap(), input);
        assert_eq!(table.get(1).unwrap(), constant);
        assert!(table.get(2).unwrap().is_null());
        assert!(table.get(3).unwrap().is_null());
        assert_eq!(table.get(4).unwrap().size(), 24);
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn thread_local_slots_never_allocate() {
        let allocator = HostAllocator::new(HostDevice::new(1)).with_capacity(0);
        let slots = vec![AllocationSlot::thread_local(0, 1 << 20)];
        let mut owned = OwnedAllocations::new(&allocator, DeviceOrdinal(0));
        let table = resolve_buffers(&slots, &Arguments::none(), &HashMap::new(), &mut owned).unwrap();
        assert!(table.get(0).unwrap().is_null());
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn missing_parameter_is_invalid_argument() {
        let allocator = HostAllocator::new(HostDevice::new(1));
        let slots = vec![AllocationSlot::parameter(0, 16, 0, ShapeIndex::root())];
        let arguments = Arguments::Inputs(vec![ExecutionInput::new(f32s(4))]);
        let mut owned = OwnedAllocations::new(&allocator, DeviceOrdinal(0));
        let err = resolve_buffers(&slots, &arguments, &HashMap::new(), &mut owned).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("unbound parameter 0"));
    }

    #[test]
    fn exhaustion_carries_size_and_report() {
        let allocator = HostAllocator::new(HostDevice::new(1)).with_capacity(100);
        let slots = vec![AllocationSlot::temp(0, 64), AllocationSlot::temp(1, 4096)];
        let mut owned = OwnedAllocations::new(&allocator, DeviceOrdinal(0));
        let err = resolve_buffers(&slots, &Arguments::none(), &HashMap::new(), &mut owned).unwrap_err();

        match err {
            Error::ResourceExhausted { requested, slot, report } => {
                assert_eq!(requested, 4096);
                assert_eq!(slot, Some(1));
                let report = report.unwrap();
                assert!(report.contains("1 of 2 slots resolved"));
                assert!(report.contains("slot 1: temp 4096 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(owned);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn misaligned_parameter_is_internal() {
        let allocator = HostAllocator::new(HostDevice::new(1));
        let slots = vec![AllocationSlot::parameter(0, 8, 0, ShapeIndex::root())];
        let arguments = Arguments::Shaped(vec![ShapedBuffer::from_region(f32s(2), DeviceRegion::new(0x1004, 8))]);
        let mut owned = OwnedAllocations::new(&allocator, DeviceOrdinal(0));
        let err = resolve_buffers(&slots, &arguments, &HashMap::new(), &mut owned).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
