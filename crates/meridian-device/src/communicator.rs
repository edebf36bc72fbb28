//! Collective communication interfaces
//!
//! A communicator is one rank's handle into a clique of cooperating devices.
//! Creating communicators is a collective operation: every rank of the
//! clique has to join with the same [`CliqueId`].

use crate::error::Result;
use crate::types::{DeviceOrdinal, DeviceRegion, ElementType, ReductionKind, StreamHandle};
use std::fmt;
use std::sync::Arc;

/// Opaque identifier that lets communication library instances in different
/// processes find each other
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CliqueId(pub String);

impl fmt::Display for CliqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local device joining a clique at a given rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicatorRank {
    pub rank: usize,
    pub device: DeviceOrdinal,
}

/// One rank's view of a clique
pub trait Communicator: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Enqueue an all-reduce of `count` elements from `send` into `recv`.
    fn all_reduce(
        &self,
        stream: StreamHandle,
        send: DeviceRegion,
        recv: DeviceRegion,
        element: ElementType,
        count: usize,
        reduction: ReductionKind,
    ) -> Result<()>;
}

/// Constructs communicators; wraps the communication library
pub trait CommunicatorFactory: Send + Sync {
    /// Generate a fresh clique id. Only one process per clique calls this.
    fn create_unique_id(&self) -> Result<CliqueId>;

    /// Create one communicator per entry of `ranks`, all joining the clique
    /// identified by `clique_id` that has `num_ranks` members in total.
    ///
    /// May block until every rank of the clique joined.
    fn create_communicators(
        &self,
        clique_id: &CliqueId,
        num_ranks: usize,
        ranks: &[CommunicatorRank],
    ) -> Result<Vec<Arc<dyn Communicator>>>;
}
