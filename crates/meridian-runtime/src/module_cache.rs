//! Per-device module and constant cache
//!
//! Each executable loads its module once per device. Constant slots are
//! resolved by symbol on load and, when the plan carries host content,
//! initialized from it. Symbols the loader never materialized stay absent,
//! which the buffer resolver turns into empty regions.

use crate::error::{Error, Result};
use crate::plan::ExecutionPlan;
use meridian_device::{DeviceOrdinal, DeviceRegion, DeviceRuntime, ModuleHandle, StreamHandle, StreamPriority};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Module loaded on one device plus its resolved constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub handle: ModuleHandle,
    /// Constant slot index to region
    pub constants: HashMap<usize, DeviceRegion>,
}

#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: RwLock<HashMap<DeviceOrdinal, Arc<LoadedModule>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module for `device`, loading it on first use.
    pub fn get_or_load(
        &self,
        plan: &ExecutionPlan,
        runtime: &dyn DeviceRuntime,
        device: DeviceOrdinal,
    ) -> Result<Arc<LoadedModule>> {
        if let Some(module) = self.get(device) {
            return Ok(module);
        }

        let mut modules = self.modules.write();
        // Another execution may have loaded it while we waited for the lock
        if let Some(module) = modules.get(&device) {
            return Ok(Arc::clone(module));
        }
        let module = Arc::new(load(plan, runtime, device)?);
        modules.insert(device, Arc::clone(&module));
        Ok(module)
    }

    pub fn get(&self, device: DeviceOrdinal) -> Option<Arc<LoadedModule>> {
        self.modules.read().get(&device).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load(plan: &ExecutionPlan, runtime: &dyn DeviceRuntime, device: DeviceOrdinal) -> Result<LoadedModule> {
    let handle = runtime.load_module(device, &plan.module)?;
    let mut constants = HashMap::new();
    let mut upload_stream: Option<StreamHandle> = None;

    for constant in &plan.constants {
        let Some(region) = runtime.resolve_symbol(handle, &constant.symbol)? else {
            tracing::debug!(symbol = %constant.symbol, %device, "constant symbol not materialized");
            continue;
        };
        if let Some(content) = &constant.content {
            if content.len() > region.size() {
                return Err(Error::internal(format!(
                    "constant {} has {} bytes of content but its symbol spans {}",
                    constant.symbol,
                    content.len(),
                    region
                )));
            }
            let stream = match upload_stream {
                Some(stream) => stream,
                None => {
                    let stream = runtime
                        .borrow_streams(device, 1, StreamPriority::Default)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| Error::failed_precondition(format!("no stream available on {device} to upload constants")))?;
                    upload_stream = Some(stream);
                    stream
                }
            };
            runtime.copy_host_to_device(stream, region, content)?;
        }
        constants.insert(constant.allocation_index, region);
    }

    if let Some(stream) = upload_stream {
        runtime.block_host_until_done(stream)?;
    }
    tracing::info!(module = %plan.module.name, %device, constants = constants.len(), "module loaded");
    Ok(LoadedModule { handle, constants })
}
