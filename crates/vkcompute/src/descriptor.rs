//! Descriptor set layout, pool and set management.
//!
//! Every slot is a read/write storage buffer visible to the compute stage.

use ash::vk;
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::error::{ComputeError, Result, VkResultExt};
use crate::memory::GpuBuffer;

/// `slot_count` storage buffer bindings at indices `0..slot_count`.
#[derive(Debug)]
pub struct DescriptorLayout {
    handle: vk::DescriptorSetLayout,
    slot_count: u32,
    released: bool,
}

impl DescriptorLayout {
    pub fn create(ctx: &DeviceContext, slot_count: u32) -> Result<Self> {
        if slot_count == 0 {
            return Err(ComputeError::invalid("descriptor layout needs at least one slot"));
        }
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..slot_count)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: bindings outlive the call.
        let handle = unsafe { ctx.device().create_descriptor_set_layout(&info, None) }
            .or_init("vkCreateDescriptorSetLayout")?;
        debug!(slot_count, "created descriptor set layout");
        Ok(Self { handle, slot_count, released: false })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Pipelines and pools created from this layout may outlive it.
    pub fn destroy(mut self, ctx: &DeviceContext) {
        // SAFETY: the handle is live and no longer used for new objects.
        unsafe { ctx.device().destroy_descriptor_set_layout(self.handle, None) };
        self.released = true;
        debug!(slot_count = self.slot_count, "destroyed descriptor set layout");
    }
}

impl Drop for DescriptorLayout {
    fn drop(&mut self) {
        if !self.released {
            warn!(slot_count = self.slot_count, "descriptor set layout dropped without destroy");
        }
    }
}

/// Sets handed out by a pool versus what it was sized for.
///
/// Kept on the host so exhaustion is reported the same way whether or not
/// the driver enforces `max_sets` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    capacity: u32,
    allocated: u32,
}

impl PoolBudget {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, allocated: 0 }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.allocated
    }

    /// Claim one set. Leaves the budget untouched on failure.
    pub fn try_reserve(&mut self) -> Result<()> {
        if self.allocated >= self.capacity {
            return Err(ComputeError::allocation(format!(
                "descriptor pool exhausted: {} of {} sets allocated",
                self.allocated, self.capacity
            )));
        }
        self.allocated += 1;
        Ok(())
    }

    /// Give back a claim whose driver allocation failed.
    pub fn cancel(&mut self) {
        self.allocated = self.allocated.saturating_sub(1);
    }
}

/// A descriptor pool sized for `capacity` sets of one layout.
#[derive(Debug)]
pub struct DescriptorPool {
    handle: vk::DescriptorPool,
    budget: PoolBudget,
    released: bool,
}

impl DescriptorPool {
    pub fn create(ctx: &DeviceContext, capacity: u32, layout: &DescriptorLayout) -> Result<Self> {
        if capacity == 0 {
            return Err(ComputeError::invalid("descriptor pool capacity must be > 0"));
        }
        let descriptor_count = capacity
            .checked_mul(layout.slot_count())
            .ok_or_else(|| ComputeError::invalid("descriptor pool size overflows u32"))?;
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count,
        }];
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(capacity)
            .pool_sizes(&pool_sizes);
        // SAFETY: pool_sizes outlive the call.
        let handle = unsafe { ctx.device().create_descriptor_pool(&info, None) }
            .or_init("vkCreateDescriptorPool")?;
        debug!(capacity, descriptor_count, "created descriptor pool");
        Ok(Self { handle, budget: PoolBudget::new(capacity), released: false })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }

    /// Allocate one set of `layout`.
    pub fn allocate_set(
        &mut self,
        ctx: &DeviceContext,
        layout: &DescriptorLayout,
    ) -> Result<DescriptorSet> {
        if self.released {
            return Err(ComputeError::AlreadyReleased("descriptor pool"));
        }
        self.budget.try_reserve()?;
        let layouts = [layout.handle()];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        // SAFETY: pool and layout are live.
        let sets = match unsafe { ctx.device().allocate_descriptor_sets(&info) }
            .or_init("vkAllocateDescriptorSets")
        {
            Ok(sets) => sets,
            Err(e) => {
                self.budget.cancel();
                return Err(e);
            }
        };
        let handle = sets.into_iter().next().ok_or_else(|| {
            self.budget.cancel();
            ComputeError::init("vkAllocateDescriptorSets returned no set")
        })?;
        debug!(
            slot_count = layout.slot_count(),
            remaining = self.budget.remaining(),
            "allocated descriptor set"
        );
        Ok(DescriptorSet { handle, bindings: vec![None; layout.slot_count() as usize] })
    }

    /// Destroy the pool, which frees every set allocated from it.
    pub fn destroy(mut self, ctx: &DeviceContext) {
        // SAFETY: no pending command references the pool's sets.
        unsafe { ctx.device().destroy_descriptor_pool(self.handle, None) };
        self.released = true;
        debug!(allocated = self.budget.allocated(), "destroyed descriptor pool");
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if !self.released {
            warn!(capacity = self.budget.capacity(), "descriptor pool dropped without destroy");
        }
    }
}

/// One descriptor set. Freed together with its pool.
#[derive(Debug)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
    bindings: Vec<Option<vk::Buffer>>,
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn slot_count(&self) -> u32 {
        self.bindings.len() as u32
    }

    /// Buffer currently written into `slot`, if any.
    pub fn binding(&self, slot: u32) -> Option<vk::Buffer> {
        self.bindings.get(slot as usize).copied().flatten()
    }

    /// Every slot has a buffer.
    pub fn is_complete(&self) -> bool {
        self.bindings.iter().all(Option::is_some)
    }

    /// Point `slot` at the whole of `buffer`, replacing any previous binding.
    ///
    /// The caller must ensure no submitted work still reads the old binding.
    pub fn bind(&mut self, ctx: &DeviceContext, slot: u32, buffer: &GpuBuffer) -> Result<()> {
        let slot_count = self.slot_count();
        let entry = self.bindings.get_mut(slot as usize).ok_or_else(|| {
            ComputeError::invalid(format!("slot {slot} out of range for {slot_count} slots"))
        })?;
        if buffer.is_released() {
            return Err(ComputeError::AlreadyReleased("buffer"));
        }

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: buffer.handle(),
            offset: 0,
            range: buffer.size(),
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: set and buffer are live; the set is not in use by a pending
        // command buffer.
        unsafe { ctx.device().update_descriptor_sets(&[write], &[]) };

        *entry = Some(buffer.handle());
        debug!(slot, size = buffer.size(), "bound storage buffer");
        Ok(())
    }
}
