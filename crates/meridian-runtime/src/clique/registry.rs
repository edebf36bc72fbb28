use super::provider::CliqueIdRequest;
use super::{CliqueKey, CliqueLease, CollectiveParams, LockableClique};
use crate::config::RendezvousConfig;
use crate::error::{Error, Result};
use meridian_device::{CliqueId, CommunicatorRank};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Placeholder published while one caller initializes a clique
struct PendingInit {
    outcome: Mutex<Option<Result<Arc<LockableClique>>>>,
    ready: Condvar,
}

impl PendingInit {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Result<Arc<LockableClique>>) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self, key: &CliqueKey, timeout: Duration) -> Result<Arc<LockableClique>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            if self.ready.wait_until(&mut outcome, deadline).timed_out() && outcome.is_none() {
                return Err(Error::DeadlineExceeded {
                    what: format!("initialization of {key} by another caller"),
                    timeout,
                });
            }
        }
    }
}

enum Entry {
    Pending(Arc<PendingInit>),
    Ready(Arc<LockableClique>),
}

/// Owner of every clique this process has initialized
///
/// The map is guarded by one mutex held only for lookups and insertions.
/// The first caller for a key inserts a placeholder and initializes
/// outside the lock; concurrent callers for the same key wait on the
/// placeholder and share its outcome. A failed initialization removes the
/// placeholder so a later call can retry.
#[derive(Default)]
pub struct CliqueRegistry {
    entries: Mutex<HashMap<CliqueKey, Entry>>,
    initializations: AtomicU64,
}

impl CliqueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or initialize the clique for `key`.
    #[tracing::instrument(skip(self, key, params, config), fields(key = %key, device = %params.global_device_id))]
    pub fn resolve(
        &self,
        key: &CliqueKey,
        num_local_participants: usize,
        params: &CollectiveParams,
        config: &RendezvousConfig,
    ) -> Result<Arc<LockableClique>> {
        if key.rank_of(params.global_device_id).is_none() {
            return Err(Error::failed_precondition(format!(
                "device {} is not a participant of {key}",
                params.global_device_id
            )));
        }

        let pending = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(Entry::Ready(clique)) => return Ok(Arc::clone(clique)),
                Some(Entry::Pending(pending)) => {
                    let pending = Arc::clone(pending);
                    drop(entries);
                    tracing::debug!("waiting for concurrent clique initialization");
                    return pending.wait(key, config.terminate_after());
                }
                None => {
                    let pending = Arc::new(PendingInit::new());
                    entries.insert(key.clone(), Entry::Pending(Arc::clone(&pending)));
                    pending
                }
            }
        };

        let outcome = self.initialize(key, num_local_participants, params, config).map(Arc::new);
        {
            let mut entries = self.entries.lock();
            match &outcome {
                Ok(clique) => {
                    entries.insert(key.clone(), Entry::Ready(Arc::clone(clique)));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "clique initialization failed; reservation rolled back");
                    entries.remove(key);
                }
            }
        }
        pending.complete(outcome.clone());
        outcome
    }

    /// Resolve `key` and take a shared lease on it.
    pub fn acquire(
        &self,
        key: &CliqueKey,
        num_local_participants: usize,
        params: &CollectiveParams,
        config: &RendezvousConfig,
    ) -> Result<CliqueLease> {
        self.resolve(key, num_local_participants, params, config)?.lease_shared()
    }

    /// Already initialized clique for `key`, if any
    pub fn get(&self, key: &CliqueKey) -> Option<Arc<LockableClique>> {
        match self.entries.lock().get(key) {
            Some(Entry::Ready(clique)) => Some(Arc::clone(clique)),
            _ => None,
        }
    }

    /// Forget the clique for `key` so the next resolve re-initializes it.
    ///
    /// Fails while the clique is leased or still initializing.
    pub fn invalidate(&self, key: &CliqueKey) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(false),
            Some(Entry::Pending(_)) => Err(Error::failed_precondition(format!("{key} is still initializing"))),
            Some(Entry::Ready(clique)) => {
                let _exclusive = clique.lease_exclusive()?;
                entries.remove(key);
                tracing::info!(clique = %key, "clique invalidated");
                Ok(true)
            }
        }
    }

    /// Number of initialized cliques
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, Entry::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initializations attempted over the registry's lifetime
    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::SeqCst)
    }

    fn initialize(
        &self,
        key: &CliqueKey,
        num_local_participants: usize,
        params: &CollectiveParams,
        config: &RendezvousConfig,
    ) -> Result<LockableClique> {
        self.initializations.fetch_add(1, Ordering::SeqCst);

        let local_ranks: Vec<CommunicatorRank> = key
            .devices()
            .iter()
            .enumerate()
            .filter_map(|(rank, device)| {
                params
                    .local_devices
                    .get(device)
                    .map(|&ordinal| CommunicatorRank { rank, device: ordinal })
            })
            .collect();

        if local_ranks.len() != num_local_participants {
            return Err(Error::failed_precondition(format!(
                "{key} declares {num_local_participants} local participants but {} of its devices are local",
                local_ranks.len()
            )));
        }

        let is_local = local_ranks.len() == key.num_devices();
        let clique_id = if is_local {
            params.factory.create_unique_id()?
        } else {
            self.exchange_clique_id(key, params, config)?
        };

        let communicators = params
            .factory
            .create_communicators(&clique_id, key.num_devices(), &local_ranks)?;
        let communicators: BTreeMap<_, _> = communicators.into_iter().map(|c| (c.rank(), c)).collect();

        tracing::info!(
            clique = %key,
            clique_id = %clique_id,
            is_local,
            local_ranks = communicators.len(),
            "clique initialized"
        );
        Ok(LockableClique::new(key.clone(), clique_id, is_local, communicators))
    }

    fn exchange_clique_id(
        &self,
        key: &CliqueKey,
        params: &CollectiveParams,
        config: &RendezvousConfig,
    ) -> Result<CliqueId> {
        let provider = params.clique_id_provider.as_ref().ok_or_else(|| {
            Error::failed_precondition(format!("{key} spans processes but no clique id provider is configured"))
        })?;
        let name = key.rendezvous_name(params.run_id);
        let is_root = key
            .devices()
            .first()
            .is_some_and(|root| params.local_devices.contains_key(root));
        let request = CliqueIdRequest {
            name: &name,
            key,
            is_root,
            timeout: config.terminate_after(),
        };
        provider.clique_id(&request, params.factory.as_ref())
    }
}
