//! Allocation strategies for the two kernel buffers.
//!
//! All three strategies give the kernel an input buffer at slot 0 and an
//! output buffer at slot 1; they only differ in how many buffer objects and
//! allocations back those slots.

use std::fmt;
use std::str::FromStr;

use ash::vk;
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::DescriptorSet;
use crate::device::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::memory::{read_pod, write_pod, DeviceAllocation, GpuBuffer, ResourceAllocator};

/// How input and output storage is laid out in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// One buffer in one allocation, bound to both slots (in place).
    SingleBuffer,
    /// Two buffers sharing one allocation at aligned offsets.
    SharedAllocation,
    /// Two buffers, each with its own allocation.
    SeparateAllocations,
}

impl AllocationStrategy {
    pub const ALL: [Self; 3] =
        [Self::SingleBuffer, Self::SharedAllocation, Self::SeparateAllocations];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleBuffer => "single-buffer",
            Self::SharedAllocation => "shared-allocation",
            Self::SeparateAllocations => "separate-allocations",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s).ok_or_else(|| {
            ComputeError::invalid(format!(
                "unknown allocation strategy {s:?} (expected one of: single-buffer, shared-allocation, separate-allocations)"
            ))
        })
    }
}

/// Round `value` up to a multiple of `alignment`. Zero alignment means 1.
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
    let alignment = alignment.max(1);
    value.checked_add(alignment - 1).map(|v| v / alignment * alignment)
}

/// Where one buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    /// Index into [`StorageLayout::allocation_sizes`].
    pub allocation: usize,
    pub offset: vk::DeviceSize,
}

/// The allocations and buffer placements a strategy needs.
///
/// Only [`plan_layout`] builds one, so there is always at least one buffer
/// and every placement names an existing allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    strategy: AllocationStrategy,
    buffer_size: vk::DeviceSize,
    allocation_sizes: Vec<vk::DeviceSize>,
    // Buffer 0 is the input; the last buffer is the output.
    buffers: Vec<BufferPlacement>,
}

impl StorageLayout {
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Requested size of every buffer.
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.buffer_size
    }

    pub fn allocation_sizes(&self) -> &[vk::DeviceSize] {
        &self.allocation_sizes
    }

    pub fn buffers(&self) -> &[BufferPlacement] {
        &self.buffers
    }

    pub fn input(&self) -> BufferPlacement {
        self.buffers[0]
    }

    pub fn output(&self) -> BufferPlacement {
        self.buffers[self.buffers.len() - 1]
    }
}

/// Plan the allocations for `strategy` with buffers of `buffer_size` bytes.
pub fn plan_layout(
    strategy: AllocationStrategy,
    buffer_size: vk::DeviceSize,
    requirements: &vk::MemoryRequirements,
) -> Result<StorageLayout> {
    if buffer_size == 0 {
        return Err(ComputeError::invalid("buffer size must be non-zero"));
    }
    let required = requirements.size.max(buffer_size);
    let (allocation_sizes, buffers) = match strategy {
        AllocationStrategy::SingleBuffer => {
            (vec![required], vec![BufferPlacement { allocation: 0, offset: 0 }])
        }
        AllocationStrategy::SharedAllocation => {
            let second = align_up(required, requirements.alignment)
                .ok_or_else(|| ComputeError::invalid("buffer size overflows when aligned"))?;
            let total = second
                .checked_add(required)
                .ok_or_else(|| ComputeError::invalid("shared allocation size overflows"))?;
            (
                vec![total],
                vec![
                    BufferPlacement { allocation: 0, offset: 0 },
                    BufferPlacement { allocation: 0, offset: second },
                ],
            )
        }
        AllocationStrategy::SeparateAllocations => (
            vec![required, required],
            vec![
                BufferPlacement { allocation: 0, offset: 0 },
                BufferPlacement { allocation: 1, offset: 0 },
            ],
        ),
    };
    Ok(StorageLayout { strategy, buffer_size, allocation_sizes, buffers })
}

/// Input and output buffers for one kernel run, provisioned per a
/// [`StorageLayout`] and kept mapped until [`KernelStorage::release`].
#[derive(Debug)]
pub struct KernelStorage {
    layout: StorageLayout,
    allocations: Vec<DeviceAllocation>,
    buffers: Vec<GpuBuffer>,
}

impl KernelStorage {
    /// Create allocations and buffers for `strategy`. Whatever was created
    /// before a failure is released again.
    pub fn provision(
        allocator: &ResourceAllocator<'_>,
        strategy: AllocationStrategy,
        buffer_size: vk::DeviceSize,
    ) -> Result<Self> {
        let requirements = allocator.buffer_requirements(buffer_size)?;
        let layout = plan_layout(strategy, buffer_size, &requirements)?;
        let mut storage = Self { layout, allocations: Vec::new(), buffers: Vec::new() };

        if let Err(e) = storage.create_resources(allocator, &requirements) {
            if let Err(cleanup) = storage.release(allocator) {
                warn!(error = %cleanup, "cleanup after failed provisioning also failed");
            }
            return Err(e);
        }

        debug!(
            %strategy,
            buffer_size,
            allocations = ?storage.layout.allocation_sizes,
            "provisioned kernel storage"
        );
        Ok(storage)
    }

    fn create_resources(
        &mut self,
        allocator: &ResourceAllocator<'_>,
        requirements: &vk::MemoryRequirements,
    ) -> Result<()> {
        for &size in &self.layout.allocation_sizes {
            self.allocations.push(allocator.allocate(size, requirements)?);
        }
        for placement in &self.layout.buffers {
            let buffer = allocator.create_buffer(
                self.layout.buffer_size,
                &self.allocations[placement.allocation],
                placement.offset,
            )?;
            self.buffers.push(buffer);
        }
        for allocation in &mut self.allocations {
            allocator.map(allocation)?;
        }
        Ok(())
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.layout.strategy
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn input(&self) -> &GpuBuffer {
        &self.buffers[0]
    }

    pub fn output(&self) -> &GpuBuffer {
        &self.buffers[self.buffers.len() - 1]
    }

    fn check_fits<T: Pod>(&self, count: usize) -> Result<()> {
        let bytes = count.checked_mul(std::mem::size_of::<T>());
        match bytes {
            Some(b) if b as u64 <= self.layout.buffer_size => Ok(()),
            _ => Err(ComputeError::invalid(format!(
                "{count} elements of {} bytes do not fit a {} byte buffer",
                std::mem::size_of::<T>(),
                self.layout.buffer_size
            ))),
        }
    }

    fn placement_bytes(&mut self, placement: BufferPlacement) -> Result<(&mut [u8], usize)> {
        let bytes = self.allocations[placement.allocation].mapped_bytes()?;
        Ok((bytes, placement.offset as usize))
    }

    /// Copy `data` to the start of the input buffer.
    pub fn write_input<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.check_fits::<T>(data.len())?;
        let (bytes, offset) = self.placement_bytes(self.layout.input())?;
        write_pod(bytes, offset, data)
    }

    /// Read `count` values from the start of the output buffer.
    pub fn read_output<T: Pod>(&mut self, count: usize) -> Result<Vec<T>> {
        self.check_fits::<T>(count)?;
        let (bytes, offset) = self.placement_bytes(self.layout.output())?;
        read_pod(bytes, offset, count)
    }

    /// Bind the input to slot 0 and the output to slot 1 of `set`.
    pub fn bind_into(&self, ctx: &DeviceContext, set: &mut DescriptorSet) -> Result<()> {
        set.bind(ctx, 0, self.input())?;
        set.bind(ctx, 1, self.output())
    }

    /// Destroy buffers, then unmap and free allocations. Every object is
    /// attempted; the first error is returned.
    pub fn release(&mut self, allocator: &ResourceAllocator<'_>) -> Result<()> {
        let mut first_err = None;
        for buffer in self.buffers.iter_mut().filter(|b| !b.is_released()) {
            if let Err(e) = allocator.free_buffer(buffer) {
                first_err.get_or_insert(e);
            }
        }
        for allocation in self.allocations.iter_mut().filter(|a| !a.is_released()) {
            if let Err(e) = allocator.free_allocation(allocation) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
