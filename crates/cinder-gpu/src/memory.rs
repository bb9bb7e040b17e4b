//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Sub-allocator for buffers and images, shared behind a mutex by every
/// thread that creates resources.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// # Safety
    /// The instance, device and physical device must be valid and outlive
    /// the allocator.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let debug_settings = gpu_allocator::AllocatorDebugSettings {
            log_memory_information: cfg!(debug_assertions),
            log_leaks_on_shutdown: true,
            ..Default::default()
        };
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings,
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    fn release(&mut self, allocation: Option<Allocation>) -> Result<()> {
        let (Some(allocation), Some(allocator)) = (allocation, self.allocator.as_mut()) else {
            return Ok(());
        };
        allocator
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Create a buffer bound to fresh memory at `location`.
    ///
    /// Host-visible locations (`CpuToGpu`, `GpuToCpu`) stay persistently
    /// mapped for the lifetime of the allocation.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let bound = self.allocate(name, requirements, location, true).and_then(|allocation| {
            unsafe {
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
            }
            Ok(allocation)
        });
        let allocation = match bound {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        tracing::trace!(name, size, ?location, "Allocated buffer");
        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            location,
        })
    }

    /// Release the buffer's memory and handle. Safe to call twice.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        self.release(buffer.allocation.take())?;
        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }
        Ok(())
    }

    /// Create an image bound to fresh memory at `location`.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let bound = self.allocate(name, requirements, location, false).and_then(|allocation| {
            unsafe {
                self.device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())?;
            }
            Ok(allocation)
        });
        let allocation = match bound {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Release the image's memory and handle. Safe to call twice.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        self.release(image.allocation.take())?;
        if image.image != vk::Image::null() {
            unsafe { self.device.destroy_image(image.image, None) };
            image.image = vk::Image::null();
        }
        Ok(())
    }

    /// Drop the underlying allocator. Must happen before the device is
    /// destroyed; allocations still alive are reported as leaks.
    pub fn shutdown(&mut self) {
        self.allocator.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation and creation metadata.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl GpuBuffer {
    /// True when the buffer lives in device-local memory the CPU cannot map.
    pub fn is_gpu_only(&self) -> bool {
        self.location == MemoryLocation::GpuOnly
    }

    /// Persistently mapped pointer, if the memory is host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Copy bytes to the start of host-visible memory.
    ///
    /// The caller paces frames so the GPU is not reading the range concurrently.
    pub fn copy_data_to_buffer(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(0, data)
    }

    /// Write a slice of plain-old-data values to the start of the buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write typed data at the given byte offset.
    pub fn write_range<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}
