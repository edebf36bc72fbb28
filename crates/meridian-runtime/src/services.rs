//! Process-wide runtime services
//!
//! [`RuntimeServices`] owns every structure shared between executions:
//! the clique registry, rendezvous hub, device access locks and custom-call
//! handlers. Create one per process (or per simulated process in tests) and
//! hand it to each [`Executable`](crate::Executable).

use crate::clique::CliqueRegistry;
use crate::config::RuntimeConfig;
use crate::custom_call::CustomCallRegistry;
use crate::device_lock::DeviceLocks;
use crate::rendezvous::RendezvousHub;
use std::sync::Arc;

pub struct RuntimeServices {
    config: RuntimeConfig,
    cliques: CliqueRegistry,
    rendezvous: RendezvousHub,
    device_locks: DeviceLocks,
    custom_calls: CustomCallRegistry,
}

impl RuntimeServices {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        tracing::debug!(?config, "runtime services created");
        Arc::new(Self {
            config,
            cliques: CliqueRegistry::new(),
            rendezvous: RendezvousHub::new(),
            device_locks: DeviceLocks::new(),
            custom_calls: CustomCallRegistry::new(),
        })
    }

    /// Services configured from `MERIDIAN_*` environment variables
    pub fn from_env() -> Arc<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cliques(&self) -> &CliqueRegistry {
        &self.cliques
    }

    pub fn rendezvous(&self) -> &RendezvousHub {
        &self.rendezvous
    }

    pub fn device_locks(&self) -> &DeviceLocks {
        &self.device_locks
    }

    pub fn custom_calls(&self) -> &CustomCallRegistry {
        &self.custom_calls
    }
}
