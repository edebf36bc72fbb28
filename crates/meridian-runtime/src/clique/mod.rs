//! Clique coordination
//!
//! A clique is the set of devices taking part in a collective, realized as
//! one communicator per local rank. Steps declare the cliques they need in
//! Prepare; [`CliqueRequests`] orders those declarations and
//! [`CliqueRegistry`] initializes each clique at most once per process.
//!
//! ```text
//! Step::prepare ──► CliqueRequests ──acquire──► CliqueRegistry::resolve
//!                     (sorted keys)                 │ placeholder, init, publish
//!                                                   ▼
//!                                      AcquiredCliques { CliqueLease }
//! ```

mod key;
mod lockable;
mod provider;
mod registry;
mod requests;

pub use key::{CliqueKey, CliqueStreamKind};
pub use lockable::{CliqueLease, LockableClique};
pub use provider::{CliqueIdProvider, CliqueIdRequest, KeyValueCliqueIdProvider, KeyValueStore};
pub use registry::CliqueRegistry;
pub use requests::{AcquiredCliques, CliqueRequests};

use meridian_device::{CommunicatorFactory, DeviceOrdinal, GlobalDeviceId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Logical run shared by every participant of one multi-device execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run:{}", self.0)
    }
}

/// Per-run collective context of one participant
#[derive(Clone)]
pub struct CollectiveParams {
    /// Device this execution runs on
    pub global_device_id: GlobalDeviceId,
    pub run_id: RunId,
    /// Every device driven by this process
    pub local_devices: BTreeMap<GlobalDeviceId, DeviceOrdinal>,
    pub factory: Arc<dyn CommunicatorFactory>,
    /// Required for cliques that span processes
    pub clique_id_provider: Option<Arc<dyn CliqueIdProvider>>,
}

impl CollectiveParams {
    pub fn new(
        global_device_id: GlobalDeviceId,
        run_id: RunId,
        local_devices: BTreeMap<GlobalDeviceId, DeviceOrdinal>,
        factory: Arc<dyn CommunicatorFactory>,
    ) -> Self {
        Self {
            global_device_id,
            run_id,
            local_devices,
            factory,
            clique_id_provider: None,
        }
    }

    pub fn with_clique_id_provider(mut self, provider: Arc<dyn CliqueIdProvider>) -> Self {
        self.clique_id_provider = Some(provider);
        self
    }

    /// Participants of the startup barrier
    pub fn num_local_participants(&self) -> usize {
        self.local_devices.len()
    }
}

impl fmt::Debug for CollectiveParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveParams")
            .field("global_device_id", &self.global_device_id)
            .field("run_id", &self.run_id)
            .field("local_devices", &self.local_devices)
            .field("has_clique_id_provider", &self.clique_id_provider.is_some())
            .finish()
    }
}
