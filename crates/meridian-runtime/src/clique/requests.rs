use super::{CliqueKey, CliqueLease, CliqueRegistry, CollectiveParams};
use crate::config::RendezvousConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct CliqueRequest {
    num_local_participants: usize,
    requester: String,
}

/// Clique requirements collected from the steps of one execution
///
/// Keys are kept in acquisition order, which depends only on the set of
/// keys and never on the order steps declared them.
#[derive(Debug, Default)]
pub struct CliqueRequests {
    requests: BTreeMap<CliqueKey, CliqueRequest>,
}

impl CliqueRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `requester` needs `key` with `num_local_participants`.
    ///
    /// A second request for the same key must declare the same count.
    pub fn request(&mut self, key: CliqueKey, num_local_participants: usize, requester: &str) -> Result<()> {
        if let Some(existing) = self.requests.get(&key) {
            if existing.num_local_participants != num_local_participants {
                return Err(Error::failed_precondition(format!(
                    "participant count mismatch for {key}: {} declares {}, {requester} declares {num_local_participants}",
                    existing.requester, existing.num_local_participants
                )));
            }
            return Ok(());
        }
        self.requests.insert(
            key,
            CliqueRequest {
                num_local_participants,
                requester: requester.to_string(),
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn num_local_participants(&self, key: &CliqueKey) -> Option<usize> {
        self.requests.get(key).map(|r| r.num_local_participants)
    }

    /// Keys in the order they must be acquired
    pub fn ordered_keys(&self) -> Vec<CliqueKey> {
        self.requests.keys().cloned().collect()
    }

    /// Resolve and lease every requested clique in acquisition order.
    pub fn acquire(
        &self,
        registry: &CliqueRegistry,
        params: Option<&CollectiveParams>,
        config: &RendezvousConfig,
    ) -> Result<AcquiredCliques> {
        let mut acquired = AcquiredCliques::empty();
        if self.requests.is_empty() {
            return Ok(acquired);
        }
        let params = params.ok_or_else(|| {
            Error::failed_precondition("steps require cliques but the run has no collective parameters")
        })?;

        for (key, request) in &self.requests {
            let lease = registry.acquire(key, request.num_local_participants, params, config)?;
            acquired.order.push(key.clone());
            acquired.leases.insert(key.clone(), lease);
        }
        tracing::debug!(cliques = acquired.order.len(), "cliques acquired");
        Ok(acquired)
    }
}

/// Leased cliques for one execution, released on drop
#[derive(Debug)]
pub struct AcquiredCliques {
    leases: BTreeMap<CliqueKey, CliqueLease>,
    order: Vec<CliqueKey>,
}

impl AcquiredCliques {
    pub const fn empty() -> Self {
        Self {
            leases: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn get(&self, key: &CliqueKey) -> Option<&CliqueLease> {
        self.leases.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Keys in the order they were acquired
    pub fn acquisition_order(&self) -> &[CliqueKey] {
        &self.order
    }
}
