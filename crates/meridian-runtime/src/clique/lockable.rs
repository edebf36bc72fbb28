use super::CliqueKey;
use crate::error::{Error, Result};
use meridian_device::{CliqueId, Communicator};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LeaseState {
    shared: usize,
    exclusive: bool,
}

/// Realized communicators of one clique, tracked for in-use state
///
/// Holds one communicator per local rank. Leases record who is issuing
/// operations: shared leases coexist, an exclusive lease excludes all
/// others. Conflicts fail immediately instead of blocking.
pub struct LockableClique {
    key: CliqueKey,
    clique_id: CliqueId,
    is_local: bool,
    communicators: BTreeMap<usize, Arc<dyn Communicator>>,
    leases: Mutex<LeaseState>,
}

impl LockableClique {
    pub fn new(
        key: CliqueKey,
        clique_id: CliqueId,
        is_local: bool,
        communicators: BTreeMap<usize, Arc<dyn Communicator>>,
    ) -> Self {
        Self {
            key,
            clique_id,
            is_local,
            communicators,
            leases: Mutex::new(LeaseState::default()),
        }
    }

    pub fn key(&self) -> &CliqueKey {
        &self.key
    }

    pub fn clique_id(&self) -> &CliqueId {
        &self.clique_id
    }

    /// Whether every participant lives in this process
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn num_local_communicators(&self) -> usize {
        self.communicators.len()
    }

    pub fn communicator(&self, rank: usize) -> Option<&Arc<dyn Communicator>> {
        self.communicators.get(&rank)
    }

    pub fn local_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.communicators.keys().copied()
    }

    pub fn active_shared_leases(&self) -> usize {
        self.leases.lock().shared
    }

    pub fn is_exclusively_leased(&self) -> bool {
        self.leases.lock().exclusive
    }

    pub fn lease_shared(self: &Arc<Self>) -> Result<CliqueLease> {
        let mut leases = self.leases.lock();
        if leases.exclusive {
            return Err(Error::failed_precondition(format!(
                "{} is exclusively leased",
                self.key
            )));
        }
        leases.shared += 1;
        Ok(CliqueLease {
            clique: Arc::clone(self),
            exclusive: false,
        })
    }

    pub fn lease_exclusive(self: &Arc<Self>) -> Result<CliqueLease> {
        let mut leases = self.leases.lock();
        if leases.exclusive || leases.shared > 0 {
            return Err(Error::failed_precondition(format!(
                "{} is in use ({} shared leases)",
                self.key, leases.shared
            )));
        }
        leases.exclusive = true;
        Ok(CliqueLease {
            clique: Arc::clone(self),
            exclusive: true,
        })
    }
}

impl fmt::Debug for LockableClique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockableClique")
            .field("key", &self.key)
            .field("clique_id", &self.clique_id)
            .field("is_local", &self.is_local)
            .field("local_ranks", &self.communicators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// RAII lease on a [`LockableClique`], released on drop
#[derive(Debug)]
pub struct CliqueLease {
    clique: Arc<LockableClique>,
    exclusive: bool,
}

impl CliqueLease {
    pub fn clique(&self) -> &Arc<LockableClique> {
        &self.clique
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Communicator for `rank`, which must be local to this process
    pub fn communicator(&self, rank: usize) -> Result<&Arc<dyn Communicator>> {
        self.clique.communicator(rank).ok_or_else(|| {
            Error::internal(format!("{} has no local communicator for rank {rank}", self.clique.key))
        })
    }
}

impl Drop for CliqueLease {
    fn drop(&mut self) {
        let mut leases = self.clique.leases.lock();
        if self.exclusive {
            leases.exclusive = false;
        } else {
            leases.shared = leases.shared.saturating_sub(1);
        }
    }
}
