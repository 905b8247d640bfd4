//! Device memory, storage buffers and host mapping.

use std::ptr::NonNull;

use ash::vk;
use bytemuck::Pod;
use scopeguard::ScopeGuard;
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::error::{ComputeError, Result, VkResultExt};

/// Properties every allocation made here must have: the host writes input
/// and reads output through a plain mapping, without explicit flushes.
pub const HOST_ACCESSIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Find a memory type index allowed by `type_bits` whose flags contain all
/// of `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            let flags = memory_properties.memory_types[i as usize].property_flags;
            allowed && flags.contains(required)
        })
        .ok_or(ComputeError::NoSuitableMemoryType { type_bits, required })
}

/// A `vkAllocateMemory` allocation, optionally mapped into host memory.
///
/// Must be released with [`ResourceAllocator::free_allocation`] (or
/// [`ResourceAllocator::free`]) before it drops.
#[derive(Debug)]
pub struct DeviceAllocation {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    mapped: Option<NonNull<u8>>,
    released: bool,
}

impl DeviceAllocation {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// The host view of the whole allocation. Fails unless mapped.
    pub fn mapped_bytes(&mut self) -> Result<&mut [u8]> {
        if self.released {
            return Err(ComputeError::AlreadyReleased("device allocation"));
        }
        let ptr = self
            .mapped
            .ok_or_else(|| ComputeError::invalid("allocation is not mapped"))?;
        // SAFETY: the mapping covers `size` bytes and stays valid until
        // unmap/free, both of which need `&mut self` and so cannot overlap
        // with the returned borrow.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if !self.released {
            warn!(size = self.size, "device allocation dropped without being freed");
        }
    }
}

/// A storage buffer bound to an offset inside a [`DeviceAllocation`].
#[derive(Debug)]
pub struct GpuBuffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    memory: vk::DeviceMemory,
    released: bool,
}

impl GpuBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Offset of the buffer inside its allocation.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// The allocation the buffer is bound to.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if !self.released {
            warn!(size = self.size, offset = self.offset, "buffer dropped without being freed");
        }
    }
}

/// Creates and releases device memory and storage buffers for one device.
pub struct ResourceAllocator<'ctx> {
    ctx: &'ctx DeviceContext,
}

impl<'ctx> ResourceAllocator<'ctx> {
    pub fn new(ctx: &'ctx DeviceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.ctx
    }

    fn device(&self) -> &'ctx ash::Device {
        self.ctx.device()
    }

    /// First memory type allowed by `requirements` that is host visible and
    /// host coherent.
    pub fn select_memory_type(&self, requirements: &vk::MemoryRequirements) -> Result<u32> {
        find_memory_type(
            self.ctx.memory_properties(),
            requirements.memory_type_bits,
            HOST_ACCESSIBLE,
        )
    }

    fn create_raw_buffer(&self, size: vk::DeviceSize) -> Result<vk::Buffer> {
        if size == 0 {
            return Err(ComputeError::invalid("buffer size must be non-zero"));
        }
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: info is a valid create info; the device outlives the call.
        unsafe { self.device().create_buffer(&info, None) }.or_alloc("vkCreateBuffer")
    }

    /// Size, alignment and allowed memory types of a storage buffer of
    /// `size` bytes. A throwaway buffer is created to ask the driver.
    pub fn buffer_requirements(&self, size: vk::DeviceSize) -> Result<vk::MemoryRequirements> {
        let probe = self.create_raw_buffer(size)?;
        // SAFETY: probe was created above and is destroyed right after.
        let requirements = unsafe {
            let r = self.device().get_buffer_memory_requirements(probe);
            self.device().destroy_buffer(probe, None);
            r
        };
        debug!(
            size,
            required = requirements.size,
            alignment = requirements.alignment,
            type_bits = requirements.memory_type_bits,
            "queried storage buffer requirements"
        );
        Ok(requirements)
    }

    /// Allocate `size` bytes of host-accessible memory compatible with
    /// `requirements`.
    pub fn allocate(
        &self,
        size: vk::DeviceSize,
        requirements: &vk::MemoryRequirements,
    ) -> Result<DeviceAllocation> {
        if size == 0 {
            return Err(ComputeError::invalid("allocation size must be non-zero"));
        }
        let memory_type_index = self.select_memory_type(requirements)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        // SAFETY: valid allocate info on a live device.
        let memory =
            unsafe { self.device().allocate_memory(&info, None) }.or_alloc("vkAllocateMemory")?;
        debug!(size, memory_type_index, "allocated device memory");
        Ok(DeviceAllocation { memory, size, memory_type_index, mapped: None, released: false })
    }

    /// Create a storage buffer of `size` bytes bound at `offset` inside
    /// `allocation`.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        allocation: &DeviceAllocation,
        offset: vk::DeviceSize,
    ) -> Result<GpuBuffer> {
        if allocation.released {
            return Err(ComputeError::AlreadyReleased("device allocation"));
        }
        let device = self.device();
        let handle = self.create_raw_buffer(size)?;
        // SAFETY: the buffer is unbound and unused on every early return.
        let guard = scopeguard::guard(handle, |b| unsafe { device.destroy_buffer(b, None) });

        // SAFETY: handle is a live buffer.
        let requirements = unsafe { device.get_buffer_memory_requirements(*guard) };
        if requirements.memory_type_bits & (1 << allocation.memory_type_index) == 0 {
            return Err(ComputeError::invalid(format!(
                "memory type {} is not allowed for this buffer (type bits {:#b})",
                allocation.memory_type_index, requirements.memory_type_bits
            )));
        }
        if offset % requirements.alignment.max(1) != 0 {
            return Err(ComputeError::invalid(format!(
                "offset {offset} is not a multiple of the required alignment {}",
                requirements.alignment
            )));
        }
        match offset.checked_add(requirements.size) {
            Some(end) if end <= allocation.size => {}
            _ => {
                return Err(ComputeError::invalid(format!(
                    "buffer of {} bytes at offset {offset} overruns allocation of {} bytes",
                    requirements.size, allocation.size
                )))
            }
        }

        // SAFETY: type, alignment and range were checked above.
        unsafe { device.bind_buffer_memory(*guard, allocation.memory, offset) }
            .or_device("vkBindBufferMemory")?;

        let handle = ScopeGuard::into_inner(guard);
        debug!(size, offset, "created storage buffer");
        Ok(GpuBuffer { handle, size, offset, memory: allocation.memory, released: false })
    }

    /// Map the whole allocation. Mapping twice returns the existing mapping.
    pub fn map<'a>(&self, allocation: &'a mut DeviceAllocation) -> Result<&'a mut [u8]> {
        if allocation.released {
            return Err(ComputeError::AlreadyReleased("device allocation"));
        }
        if allocation.mapped.is_none() {
            // SAFETY: the allocation is host visible (see `allocate`) and not
            // currently mapped.
            let ptr = unsafe {
                self.device().map_memory(
                    allocation.memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
            }
            .or_device("vkMapMemory")?;
            let ptr = NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| ComputeError::init("vkMapMemory returned a null pointer"))?;
            allocation.mapped = Some(ptr);
            debug!(size = allocation.size, "mapped device memory");
        }
        allocation.mapped_bytes()
    }

    /// Unmap if mapped. A no-op otherwise.
    pub fn unmap(&self, allocation: &mut DeviceAllocation) -> Result<()> {
        if allocation.released {
            return Err(ComputeError::AlreadyReleased("device allocation"));
        }
        if allocation.mapped.take().is_some() {
            // SAFETY: the allocation was mapped and no host slice borrows it.
            unsafe { self.device().unmap_memory(allocation.memory) };
            debug!(size = allocation.size, "unmapped device memory");
        }
        Ok(())
    }

    /// Unmap, destroy the buffer, free the memory.
    pub fn free(&self, buffer: &mut GpuBuffer, allocation: &mut DeviceAllocation) -> Result<()> {
        if buffer.released {
            return Err(ComputeError::AlreadyReleased("buffer"));
        }
        if allocation.released {
            return Err(ComputeError::AlreadyReleased("device allocation"));
        }
        self.free_buffer(buffer)?;
        self.free_allocation(allocation)
    }

    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        if buffer.released {
            return Err(ComputeError::AlreadyReleased("buffer"));
        }
        // SAFETY: no pending command uses the buffer (single synchronous
        // dispatch model).
        unsafe { self.device().destroy_buffer(buffer.handle, None) };
        buffer.released = true;
        debug!(size = buffer.size, offset = buffer.offset, "destroyed storage buffer");
        Ok(())
    }

    /// Unmap if needed, then free. Buffers bound to the allocation must be
    /// destroyed first.
    pub fn free_allocation(&self, allocation: &mut DeviceAllocation) -> Result<()> {
        self.unmap(allocation)?;
        // SAFETY: unmapped above, and bound buffers are the caller's to destroy.
        unsafe { self.device().free_memory(allocation.memory, None) };
        allocation.released = true;
        debug!(size = allocation.size, "freed device memory");
        Ok(())
    }
}

/// Copy `data` into `dst` starting at byte `offset`.
pub fn write_pod<T: Pod>(dst: &mut [u8], offset: usize, data: &[T]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let end = offset
        .checked_add(bytes.len())
        .filter(|&end| end <= dst.len())
        .ok_or_else(|| {
            ComputeError::invalid(format!(
                "write of {} bytes at offset {offset} exceeds mapping of {} bytes",
                bytes.len(),
                dst.len()
            ))
        })?;
    dst[offset..end].copy_from_slice(bytes);
    Ok(())
}

/// Read `count` values of `T` from `src` starting at byte `offset`.
pub fn read_pod<T: Pod>(src: &[u8], offset: usize, count: usize) -> Result<Vec<T>> {
    let elem = std::mem::size_of::<T>();
    if elem == 0 {
        return Err(ComputeError::invalid("cannot read zero-sized elements"));
    }
    let end = count
        .checked_mul(elem)
        .and_then(|len| offset.checked_add(len))
        .filter(|&end| end <= src.len())
        .ok_or_else(|| {
            ComputeError::invalid(format!(
                "read of {count} x {elem} bytes at offset {offset} exceeds mapping of {} bytes",
                src.len()
            ))
        })?;
    Ok(src[offset..end].chunks_exact(elem).map(bytemuck::pod_read_unaligned).collect())
}
