//! Dispatcher for finalized device step plans
//!
//! This crate provides:
//! - **Buffer resolution**: binds every allocation slot of a plan to a
//!   concrete device region per execution
//! - **Clique coordination**: orders, initializes (at most once per process)
//!   and leases the communicator sets collectives run on
//! - **Step engine**: drives steps through prepare, acquire, initialize and
//!   execute with the right streams and a startup barrier
//! - **Output aliasing**: reuses donated inputs, copies borrowed ones, and
//!   reports which results alias inputs
//!
//! # Architecture
//!
//! ```text
//! RunOptions + Arguments
//!         │
//!         ▼
//! ┌──────────────────┐    ┌───────────────────┐
//! │ resolve_buffers  │───►│  resolve_outputs  │
//! └──────────────────┘    └─────────┬─────────┘
//!                                   ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ engine: prepare ─► CliqueRequests ─► CliqueRegistry  │
//! │         ─► barrier ─► initialize ─► execute          │
//! └─────────────────────────┬────────────────────────────┘
//!                           ▼
//!                    ExecutionOutput
//! ```
//!
//! # Usage
//!
//! ```rust
//! use meridian_device::host::{HostAllocator, HostDevice};
//! use meridian_device::{DeviceOrdinal, ElementType, LaunchDimensions};
//! use meridian_runtime::{
//!     AllocationSlot, Arguments, BufferSlice, Executable, ExecutionPlan, OutputInfo, RunOptions, RuntimeConfig,
//!     RuntimeServices, Shape, ShapeIndex, Step,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = HostDevice::new(1);
//! device.register_kernel("iota", |args| {
//!     let values: Vec<u32> = (0..4).collect();
//!     args.write_from(0, &values)
//! });
//!
//! let plan = ExecutionPlan::new(
//!     "iota",
//!     vec![AllocationSlot::live_out(0, 16)],
//!     vec![Step::kernel("iota", "iota", vec![BufferSlice::new(0, 0, 16)], LaunchDimensions::linear(1, 4))],
//!     Shape::array(ElementType::U32, [4]),
//! )
//! .with_output(ShapeIndex::root(), OutputInfo::new(0));
//!
//! let executable = Executable::new(plan, RuntimeServices::new(RuntimeConfig::default()))?;
//! let allocator = Arc::new(HostAllocator::new(device.clone()));
//! let options = RunOptions::new(DeviceOrdinal(0), Arc::new(device.clone()), allocator.clone());
//!
//! let output = executable.execute(&options, &Arguments::none())?;
//! let region = output.root().ok_or("missing result")?;
//! assert_eq!(device.read_as::<u32>(region)?, vec![0, 1, 2, 3]);
//! output.release(allocator.as_ref(), DeviceOrdinal(0))?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod clique;
pub mod config;
pub mod custom_call;
pub mod device_lock;
mod engine;
pub mod error;
pub mod executable;
pub mod module_cache;
pub mod output;
pub mod plan;
pub mod profile;
pub mod rendezvous;
pub mod services;
pub mod shape;
pub mod step;

pub use buffer::{
    resolve_buffers, Arguments, BufferSlice, BufferTable, ExecutionInput, InputBuffer, OwnedAllocations, ShapedBuffer,
};
pub use clique::{
    AcquiredCliques, CliqueIdProvider, CliqueKey, CliqueLease, CliqueRegistry, CliqueRequests, CliqueStreamKind,
    CollectiveParams, KeyValueCliqueIdProvider, KeyValueStore, LockableClique, RunId,
};
pub use config::{DebugOptions, RendezvousConfig, RuntimeConfig};
pub use custom_call::{CustomCallFrame, CustomCallHandler, CustomCallRegistry};
pub use error::{Error, ErrorKind, Result};
pub use executable::{Executable, ExecutionOutput, RunOptions};
pub use output::{resolve_outputs, ResolvedOutputs};
pub use plan::{AliasKind, AllocationSlot, ExecutionPlan, OutputInfo, SlotKind, TargetRequirement};
pub use profile::{ExecutionProfile, ProfileSnapshot};
pub use rendezvous::RendezvousHub;
pub use services::RuntimeServices;
pub use shape::{Shape, ShapeIndex, ShapeTree};
pub use step::{
    BranchIndexKind, CollectiveOp, CollectiveStep, CustomCallStep, Step, StepContext, StepInfo, StepKind,
};
