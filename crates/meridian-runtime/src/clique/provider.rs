//! Clique-id exchange for cliques that span processes

use super::CliqueKey;
use crate::error::{Error, Result};
use meridian_device::{CliqueId, CommunicatorFactory};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a process knows when it needs the id of a non-local clique
#[derive(Debug, Clone)]
pub struct CliqueIdRequest<'a> {
    /// Name every participating process derives identically
    pub name: &'a str,
    pub key: &'a CliqueKey,
    /// This process hosts rank 0 and generates the id
    pub is_root: bool,
    pub timeout: Duration,
}

/// Agrees on one [`CliqueId`] across every process in a clique
pub trait CliqueIdProvider: Send + Sync {
    fn clique_id(&self, request: &CliqueIdRequest<'_>, factory: &dyn CommunicatorFactory) -> Result<CliqueId>;
}

/// Blocking in-memory key/value store
///
/// Stand-in for the distributed key/value service processes use to
/// publish clique ids to each other. Entries live until [`remove`]d or the
/// store is dropped. [`KeyValueCliqueIdProvider`] publishes one entry per
/// non-local clique and run id and never removes it; long-lived stores
/// should drop entries once every participant has finished the run.
///
/// [`remove`]: KeyValueStore::remove
#[derive(Default)]
pub struct KeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    published: Condvar,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
        self.published.notify_all();
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wait up to `timeout` for `key` to be published.
    pub fn blocking_get(&self, key: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            if let Some(value) = entries.get(key) {
                return Some(value.clone());
            }
            if self.published.wait_until(&mut entries, deadline).timed_out() {
                return entries.get(key).cloned();
            }
        }
    }
}

/// [`CliqueIdProvider`] that publishes ids through a [`KeyValueStore`]
#[derive(Clone)]
pub struct KeyValueCliqueIdProvider {
    store: Arc<KeyValueStore>,
}

impl KeyValueCliqueIdProvider {
    pub fn new(store: Arc<KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    fn store_key(name: &str) -> String {
        format!("clique_id:{name}")
    }

    /// Drop the id published under rendezvous `name`, returning whether one existed.
    pub fn forget(&self, name: &str) -> bool {
        self.store.remove(&Self::store_key(name)).is_some()
    }
}

impl CliqueIdProvider for KeyValueCliqueIdProvider {
    fn clique_id(&self, request: &CliqueIdRequest<'_>, factory: &dyn CommunicatorFactory) -> Result<CliqueId> {
        let store_key = Self::store_key(request.name);
        if request.is_root {
            let id = factory.create_unique_id()?;
            tracing::debug!(clique = %request.key, id = %id, "publishing clique id");
            self.store.set(store_key, id.0.clone());
            return Ok(id);
        }

        self.store
            .blocking_get(&store_key, request.timeout)
            .map(CliqueId)
            .ok_or_else(|| Error::DeadlineExceeded {
                what: format!("clique id exchange for {}", request.name),
                timeout: request.timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use meridian_device::host::{HostCommunicatorFactory, HostDevice};
    use meridian_device::GlobalDeviceId;
    use std::thread;

    fn request<'a>(key: &'a CliqueKey, is_root: bool, timeout: Duration) -> CliqueIdRequest<'a> {
        CliqueIdRequest {
            name: "clique[0,1;compute]/run:1",
            key,
            is_root,
            timeout,
        }
    }

    #[test]
    fn root_publishes_and_peer_receives() {
        let key = CliqueKey::compute(vec![GlobalDeviceId(0), GlobalDeviceId(1)]);
        let provider = KeyValueCliqueIdProvider::new(Arc::new(KeyValueStore::new()));
        let factory = HostCommunicatorFactory::new(HostDevice::new(2));

        let peer = {
            let provider = provider.clone();
            let factory = factory.clone();
            let key = key.clone();
            thread::spawn(move || {
                provider
                    .clique_id(&request(&key, false, Duration::from_secs(5)), &factory)
                    .unwrap()
            })
        };
        let root_id = provider
            .clique_id(&request(&key, true, Duration::from_secs(5)), &factory)
            .unwrap();

        assert_eq!(peer.join().unwrap(), root_id);
        assert_eq!(factory.unique_ids_issued(), 1);
    }

    #[test]
    fn published_ids_stay_until_forgotten() {
        let key = CliqueKey::compute(vec![GlobalDeviceId(0), GlobalDeviceId(1)]);
        let store = Arc::new(KeyValueStore::new());
        let provider = KeyValueCliqueIdProvider::new(Arc::clone(&store));
        let factory = HostCommunicatorFactory::new(HostDevice::new(2));
        let request = request(&key, true, Duration::from_secs(1));

        provider.clique_id(&request, &factory).unwrap();
        assert_eq!(store.len(), 1);

        assert!(provider.forget(request.name));
        assert!(store.is_empty());
        assert!(!provider.forget(request.name));
    }

    #[test]
    fn missing_root_times_out() {
        let key = CliqueKey::compute(vec![GlobalDeviceId(0), GlobalDeviceId(1)]);
        let provider = KeyValueCliqueIdProvider::new(Arc::new(KeyValueStore::new()));
        let factory = HostCommunicatorFactory::new(HostDevice::new(2));
        let err = provider
            .clique_id(&request(&key, false, Duration::from_millis(10)), &factory)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
