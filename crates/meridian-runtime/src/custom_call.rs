//! Registry of host-side handlers for custom-call steps

use crate::error::Result;
use meridian_device::{DeviceOrdinal, DeviceRegion, DeviceRuntime, StreamHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a custom-call handler may touch
pub struct CustomCallFrame<'a> {
    pub runtime: &'a dyn DeviceRuntime,
    pub device: DeviceOrdinal,
    pub stream: StreamHandle,
    pub operands: Vec<DeviceRegion>,
    pub results: Vec<DeviceRegion>,
    /// Backend-specific configuration captured at lowering time
    pub opaque: &'a [u8],
}

pub type CustomCallHandler = Arc<dyn Fn(&CustomCallFrame<'_>) -> Result<()> + Send + Sync>;

/// Handlers keyed by (platform, target name)
#[derive(Default)]
pub struct CustomCallRegistry {
    handlers: RwLock<HashMap<(String, String), CustomCallHandler>>,
}

impl CustomCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, platform: impl Into<String>, target: impl Into<String>, handler: F)
    where
        F: Fn(&CustomCallFrame<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let key = (platform.into(), target.into());
        tracing::debug!(platform = %key.0, target = %key.1, "custom call registered");
        self.handlers.write().insert(key, Arc::new(handler));
    }

    pub fn lookup(&self, platform: &str, target: &str) -> Option<CustomCallHandler> {
        self.handlers
            .read()
            .get(&(platform.to_string(), target.to_string()))
            .cloned()
    }

    pub fn contains(&self, platform: &str, target: &str) -> bool {
        self.lookup(platform, target).is_some()
    }
}
