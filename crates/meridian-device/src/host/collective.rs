//! In-process collectives for the host backend
//!
//! Ranks of one clique share a [`HostCollectiveGroup`]. Each all-reduce is a
//! generation: ranks deposit their contribution, the last arrival reduces,
//! and everyone copies the result out.

use super::HostDevice;
use crate::communicator::{CliqueId, Communicator, CommunicatorFactory, CommunicatorRank};
use crate::error::{DeviceError, Result};
use crate::types::{DeviceRegion, ElementType, ReductionKind, StreamHandle};
use bytemuck::Pod;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct GroupState {
    generation: u64,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    result: Option<Arc<Vec<u8>>>,
    departed: usize,
}

struct HostCollectiveGroup {
    num_ranks: usize,
    timeout: Duration,
    state: Mutex<GroupState>,
    changed: Condvar,
}

impl HostCollectiveGroup {
    fn new(num_ranks: usize, timeout: Duration) -> Self {
        Self {
            num_ranks,
            timeout,
            state: Mutex::new(GroupState {
                generation: 0,
                contributions: vec![None; num_ranks],
                arrived: 0,
                result: None,
                departed: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn all_reduce(
        &self,
        rank: usize,
        contribution: Vec<u8>,
        element: ElementType,
        reduction: ReductionKind,
    ) -> Result<Arc<Vec<u8>>> {
        let mut state = self.state.lock();

        // Wait for the previous generation to drain before contributing.
        while state.result.is_some() {
            if self.changed.wait_for(&mut state, self.timeout).timed_out() {
                return Err(self.timeout_error());
            }
        }

        let generation = state.generation;
        state.contributions[rank] = Some(contribution);
        state.arrived += 1;

        if state.arrived == self.num_ranks {
            let contributions: Vec<Vec<u8>> = state.contributions.iter_mut().filter_map(Option::take).collect();
            state.result = Some(Arc::new(reduce(&contributions, element, reduction)?));
            state.arrived = 0;
            state.generation += 1;
            self.changed.notify_all();
        } else {
            while state.generation == generation {
                if self.changed.wait_for(&mut state, self.timeout).timed_out() {
                    state.contributions[rank] = None;
                    state.arrived -= 1;
                    return Err(self.timeout_error());
                }
            }
        }

        let result = state
            .result
            .clone()
            .ok_or_else(|| DeviceError::communication("all-reduce result missing"))?;
        state.departed += 1;
        if state.departed == self.num_ranks {
            state.result = None;
            state.departed = 0;
            self.changed.notify_all();
        }
        Ok(result)
    }

    fn timeout_error(&self) -> DeviceError {
        DeviceError::Timeout {
            what: format!("host all-reduce across {} ranks", self.num_ranks),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

fn combine<T: Pod>(accumulator: &mut [u8], other: &[u8], op: impl Fn(T, T) -> T) {
    let width = std::mem::size_of::<T>();
    for (acc, value) in accumulator.chunks_exact_mut(width).zip(other.chunks_exact(width)) {
        let reduced = op(bytemuck::pod_read_unaligned(acc), bytemuck::pod_read_unaligned(value));
        acc.copy_from_slice(bytemuck::bytes_of(&reduced));
    }
}

fn reduce(contributions: &[Vec<u8>], element: ElementType, reduction: ReductionKind) -> Result<Vec<u8>> {
    let (first, rest) = contributions
        .split_first()
        .ok_or_else(|| DeviceError::communication("all-reduce without contributions"))?;
    let mut accumulator = first.clone();

    for other in rest {
        if other.len() != accumulator.len() {
            return Err(DeviceError::communication(format!(
                "all-reduce size mismatch: {} vs {} bytes",
                other.len(),
                accumulator.len()
            )));
        }
        match (element, reduction) {
            (ElementType::F32, ReductionKind::Sum) => combine::<f32>(&mut accumulator, other, |a, b| a + b),
            (ElementType::F32, ReductionKind::Min) => combine::<f32>(&mut accumulator, other, f32::min),
            (ElementType::F32, ReductionKind::Max) => combine::<f32>(&mut accumulator, other, f32::max),
            (ElementType::F64, ReductionKind::Sum) => combine::<f64>(&mut accumulator, other, |a, b| a + b),
            (ElementType::F64, ReductionKind::Min) => combine::<f64>(&mut accumulator, other, f64::min),
            (ElementType::F64, ReductionKind::Max) => combine::<f64>(&mut accumulator, other, f64::max),
            (ElementType::I32, ReductionKind::Sum) => combine::<i32>(&mut accumulator, other, i32::wrapping_add),
            (ElementType::I32, ReductionKind::Min) => combine::<i32>(&mut accumulator, other, i32::min),
            (ElementType::I32, ReductionKind::Max) => combine::<i32>(&mut accumulator, other, i32::max),
            (ElementType::U32, ReductionKind::Sum) => combine::<u32>(&mut accumulator, other, u32::wrapping_add),
            (ElementType::U32, ReductionKind::Min) => combine::<u32>(&mut accumulator, other, u32::min),
            (ElementType::U32, ReductionKind::Max) => combine::<u32>(&mut accumulator, other, u32::max),
            (ElementType::U8, ReductionKind::Sum) => combine::<u8>(&mut accumulator, other, u8::wrapping_add),
            (ElementType::U8, ReductionKind::Min) => combine::<u8>(&mut accumulator, other, u8::min),
            (ElementType::U8, ReductionKind::Max) => combine::<u8>(&mut accumulator, other, u8::max),
            // Predicates reduce as logical or (sum, max) and logical and (min).
            (ElementType::Pred, ReductionKind::Min) => combine::<u8>(&mut accumulator, other, |a, b| u8::from(a != 0 && b != 0)),
            (ElementType::Pred, _) => combine::<u8>(&mut accumulator, other, |a, b| u8::from(a != 0 || b != 0)),
        }
    }
    Ok(accumulator)
}

/// One rank's handle onto a host collective group
pub struct HostCommunicator {
    rank: usize,
    clique_id: CliqueId,
    device: HostDevice,
    group: Arc<HostCollectiveGroup>,
}

impl std::fmt::Debug for HostCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCommunicator")
            .field("clique_id", &self.clique_id)
            .field("rank", &self.rank)
            .field("num_ranks", &self.group.num_ranks)
            .finish()
    }
}

impl Communicator for HostCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.group.num_ranks
    }

    fn all_reduce(
        &self,
        _stream: StreamHandle,
        send: DeviceRegion,
        recv: DeviceRegion,
        element: ElementType,
        count: usize,
        reduction: ReductionKind,
    ) -> Result<()> {
        let bytes = count * element.size_bytes();
        let send = send.slice(0, bytes).ok_or(DeviceError::OutOfBounds {
            address: send.address(),
            size: bytes,
            allocation_size: send.size(),
        })?;
        let contribution = self.device.read(send)?;
        let result = self.group.all_reduce(self.rank, contribution, element, reduction)?;
        self.device.write(recv, &result)
    }
}

/// [`CommunicatorFactory`] for in-process cliques
///
/// Clones of one factory stand in for a network: communicators created for
/// the same [`CliqueId`] from any clone join the same group.
#[derive(Clone)]
pub struct HostCommunicatorFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    device: HostDevice,
    timeout: Duration,
    next_id: AtomicU64,
    creations: AtomicU64,
    groups: Mutex<HashMap<CliqueId, Arc<HostCollectiveGroup>>>,
}

impl HostCommunicatorFactory {
    pub fn new(device: HostDevice) -> Self {
        Self::with_timeout(device, DEFAULT_TIMEOUT)
    }

    /// Fail collectives that wait longer than `timeout` for peers.
    pub fn with_timeout(device: HostDevice, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                device,
                timeout,
                next_id: AtomicU64::new(1),
                creations: AtomicU64::new(0),
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of `create_communicators` calls served
    pub fn creation_count(&self) -> u64 {
        self.inner.creations.load(Ordering::SeqCst)
    }

    pub fn unique_ids_issued(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst) - 1
    }
}

impl CommunicatorFactory for HostCommunicatorFactory {
    fn create_unique_id(&self) -> Result<CliqueId> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CliqueId(format!("host-clique-{id}")))
    }

    fn create_communicators(
        &self,
        clique_id: &CliqueId,
        num_ranks: usize,
        ranks: &[CommunicatorRank],
    ) -> Result<Vec<Arc<dyn Communicator>>> {
        if num_ranks == 0 {
            return Err(DeviceError::communication("clique must have at least one rank"));
        }
        let group = {
            let mut groups = self.inner.groups.lock();
            let group = groups
                .entry(clique_id.clone())
                .or_insert_with(|| Arc::new(HostCollectiveGroup::new(num_ranks, self.inner.timeout)));
            if group.num_ranks != num_ranks {
                return Err(DeviceError::communication(format!(
                    "clique {clique_id} has {} ranks, requested {num_ranks}",
                    group.num_ranks
                )));
            }
            Arc::clone(group)
        };

        let mut communicators: Vec<Arc<dyn Communicator>> = Vec::with_capacity(ranks.len());
        for rank in ranks {
            if rank.rank >= num_ranks {
                return Err(DeviceError::communication(format!(
                    "rank {} out of range for {num_ranks} ranks",
                    rank.rank
                )));
            }
            communicators.push(Arc::new(HostCommunicator {
                rank: rank.rank,
                clique_id: clique_id.clone(),
                device: self.inner.device.clone(),
                group: Arc::clone(&group),
            }));
        }
        self.inner.creations.fetch_add(1, Ordering::SeqCst);
        Ok(communicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceOrdinal;
    use std::thread;

    #[test]
    fn reduce_sums_floats() {
        let a: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec();
        let b: Vec<u8> = bytemuck::cast_slice(&[3.0f32, 4.0]).to_vec();
        let out = reduce(&[a, b], ElementType::F32, ReductionKind::Sum).unwrap();
        let values: Vec<f32> = out.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(values, vec![4.0, 6.0]);
    }

    #[test]
    fn reduce_predicates_logically() {
        let out = reduce(&[vec![1, 0, 1], vec![1, 0, 0]], ElementType::Pred, ReductionKind::Min).unwrap();
        assert_eq!(out, vec![1, 0, 0]);
        let out = reduce(&[vec![1, 0, 1], vec![1, 0, 0]], ElementType::Pred, ReductionKind::Sum).unwrap();
        assert_eq!(out, vec![1, 0, 1]);
    }

    #[test]
    fn two_ranks_all_reduce() {
        let device = HostDevice::new(2);
        let factory = HostCommunicatorFactory::new(device.clone());
        let id = factory.create_unique_id().unwrap();
        let communicators = factory
            .create_communicators(
                &id,
                2,
                &[
                    CommunicatorRank { rank: 0, device: DeviceOrdinal(0) },
                    CommunicatorRank { rank: 1, device: DeviceOrdinal(1) },
                ],
            )
            .unwrap();

        let handles: Vec<_> = communicators
            .into_iter()
            .enumerate()
            .map(|(rank, communicator)| {
                let device = device.clone();
                thread::spawn(move || {
                    let send = device.allocate_raw(8);
                    let recv = device.allocate_raw(8);
                    device.write_from(send, &[rank as i32 + 1, 10]).unwrap();
                    let stream = StreamHandle { device: DeviceOrdinal(rank as u32), id: 0 };
                    communicator
                        .all_reduce(stream, send, recv, ElementType::I32, 2, ReductionKind::Sum)
                        .unwrap();
                    device.read_as::<i32>(recv).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![3, 20]);
        }
    }

    #[test]
    fn lone_rank_times_out() {
        let device = HostDevice::new(2);
        let factory = HostCommunicatorFactory::with_timeout(device.clone(), Duration::from_millis(20));
        let id = factory.create_unique_id().unwrap();
        let communicators = factory
            .create_communicators(&id, 2, &[CommunicatorRank { rank: 0, device: DeviceOrdinal(0) }])
            .unwrap();
        let region = device.allocate_raw(4);
        let stream = StreamHandle { device: DeviceOrdinal(0), id: 0 };
        let err = communicators[0]
            .all_reduce(stream, region, region, ElementType::U32, 1, ReductionKind::Max)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
    }

    #[test]
    fn rank_count_mismatch_is_rejected() {
        let factory = HostCommunicatorFactory::new(HostDevice::new(2));
        let id = CliqueId("shared".into());
        factory.create_communicators(&id, 2, &[]).unwrap();
        assert!(factory.create_communicators(&id, 3, &[]).is_err());
        assert_eq!(factory.creation_count(), 1);
    }
}
