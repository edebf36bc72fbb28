use super::{PrepareParams, StepContext, StepInfo};
use crate::buffer::BufferSlice;
use crate::clique::{CliqueKey, CliqueRequests, CliqueStreamKind};
use crate::error::{Error, Result};
use meridian_device::{ElementType, GlobalDeviceId, ReductionKind, StreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    AllReduce {
        element: ElementType,
        count: usize,
        reduction: ReductionKind,
    },
}

/// Collective operation over a clique of devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveStep {
    /// Participating devices in rank order
    pub devices: Vec<GlobalDeviceId>,
    /// Participants driven by this process
    pub num_local_participants: usize,
    pub stream_kind: CliqueStreamKind,
    /// Async stream index; `None` runs on the step's execution stream
    pub async_stream: Option<usize>,
    pub op: CollectiveOp,
    pub source: BufferSlice,
    pub destination: BufferSlice,
}

impl CollectiveStep {
    #[allow(clippy::too_many_arguments)]
    pub fn all_reduce(
        devices: Vec<GlobalDeviceId>,
        num_local_participants: usize,
        element: ElementType,
        count: usize,
        reduction: ReductionKind,
        source: BufferSlice,
        destination: BufferSlice,
    ) -> Self {
        Self {
            devices,
            num_local_participants,
            stream_kind: CliqueStreamKind::Compute,
            async_stream: None,
            op: CollectiveOp::AllReduce {
                element,
                count,
                reduction,
            },
            source,
            destination,
        }
    }

    pub fn on_async_stream(mut self, index: usize) -> Self {
        self.async_stream = Some(index);
        self
    }

    pub fn key(&self) -> CliqueKey {
        CliqueKey::new(self.devices.clone(), self.stream_kind)
    }

    pub(super) fn prepare(
        &self,
        info: &StepInfo,
        params: &PrepareParams<'_>,
        requests: &mut CliqueRequests,
    ) -> Result<()> {
        if params.collective.is_none() {
            return Err(Error::failed_precondition(format!(
                "collective step {} requires collective parameters",
                info.annotation
            )));
        }
        requests.request(self.key(), self.num_local_participants, &info.annotation)
    }

    pub(super) fn execute(&self, info: &StepInfo, ctx: &StepContext<'_>, stream: StreamHandle) -> Result<()> {
        let params = ctx.collective.ok_or_else(|| {
            Error::failed_precondition(format!(
                "collective step {} requires collective parameters",
                info.annotation
            ))
        })?;
        let key = self.key();
        let lease = ctx
            .cliques
            .get(&key)
            .ok_or_else(|| Error::internal(format!("step {}: {key} was not acquired", info.annotation)))?;
        let rank = key.rank_of(params.global_device_id).ok_or_else(|| {
            Error::failed_precondition(format!(
                "device {} does not participate in {key}",
                params.global_device_id
            ))
        })?;
        let communicator = lease.communicator(rank)?;

        let stream = match self.async_stream {
            Some(index) => ctx.async_stream(index, info)?,
            None => stream,
        };
        let send = ctx.buffers.slice(&self.source)?;
        let recv = ctx.buffers.slice(&self.destination)?;

        match self.op {
            CollectiveOp::AllReduce {
                element,
                count,
                reduction,
            } => {
                let bytes = element.size_bytes() * count;
                if bytes > send.size() || bytes > recv.size() {
                    return Err(Error::internal(format!(
                        "step {}: all-reduce of {count} {element} exceeds {} or {}",
                        info.annotation, self.source, self.destination
                    )));
                }
                communicator.all_reduce(stream, send, recv, element, count, reduction)?;
            }
        }
        Ok(())
    }
}
