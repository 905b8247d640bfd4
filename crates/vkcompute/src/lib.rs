//! Single-shot Vulkan compute orchestration.
//!
//! Selects a compute-capable device, allocates host-visible storage, binds it
//! to descriptor slots, builds a compute pipeline from SPIR-V and dispatches
//! it synchronously behind a fence.
//!
//! ```no_run
//! use vkcompute::{AllocationStrategy, BatchRunner, ComputeConfig, DeviceContext, kernels};
//!
//! # fn main() -> vkcompute::Result<()> {
//! let config = ComputeConfig::default();
//! let ctx = DeviceContext::create(&config)?;
//! let bytes = kernels::sum_kernel_bytes();
//! let mut runner = BatchRunner::with_config(&ctx, &config, &bytes, kernels::ENTRY_POINT)?;
//! let input: Vec<i32> = (0..256).collect();
//! let output = runner.run(AllocationStrategy::SharedAllocation, &input)?;
//! assert_eq!(output.values[10], 20);
//! # Ok(())
//! # }
//! ```
//!
//! Nothing in this crate installs a `tracing` subscriber; binaries do that.

pub mod batch;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernels;
pub mod memory;
pub mod pipeline;
pub mod spirv;
pub mod strategy;

pub use batch::{BatchOutput, BatchRunner};
pub use config::{ComputeConfig, ConfigError, DeviceCriteria};
pub use descriptor::{DescriptorLayout, DescriptorPool, DescriptorSet, PoolBudget};
pub use device::{
    choose_device, find_compute_queue_family, ComputeInstance, DeviceContext, DeviceIdentity,
    HangFlag, SelectedDevice, SelectionReason,
};
pub use dispatch::{
    await_completion, workgroup_count, CompletionSignal, DispatchReport, DispatchState,
    DispatchTracker, Dispatcher, Fence,
};
pub use error::{ComputeError, ErrorKind, Result};
pub use memory::{find_memory_type, DeviceAllocation, GpuBuffer, ResourceAllocator};
pub use pipeline::ComputePipeline;
pub use spirv::{EntryPoint, SpirvModule};
pub use strategy::{plan_layout, AllocationStrategy, KernelStorage, StorageLayout};
