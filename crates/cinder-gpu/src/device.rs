//! Driver operations used by command queue managers.
//!
//! [`QueueDevice`] is the narrow slice of the Vulkan device that fence-gated
//! submission needs. [`VulkanQueueDevice`] forwards to `ash`; tests use the
//! in-memory device from [`crate::testing`].

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::texture::Texture;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CString;
use std::sync::Arc;

/// Outcome of a bounded fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// A device queue plus the lock that serializes access to it.
///
/// Several managers may target the same `VkQueue` (for example the frame
/// loop and the mip generation thread both use the graphics queue); Vulkan
/// requires external synchronization of submissions, so every clone shares
/// one lock.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    queue: vk::Queue,
    family: u32,
    lock: Arc<Mutex<()>>,
}

impl QueueHandle {
    pub fn new(queue: vk::Queue, family: u32) -> Self {
        Self {
            queue,
            family,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn raw(&self) -> vk::Queue {
        self.queue
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    /// Run `f` with exclusive access to the queue.
    pub fn with_lock<T>(&self, f: impl FnOnce(vk::Queue) -> T) -> T {
        let _guard = self.lock.lock();
        f(self.queue)
    }
}

/// One queue submission: command buffers plus semaphore waits and signals.
#[derive(Clone, Debug, Default)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl SubmitBatch {
    /// Submit a single command buffer.
    pub fn new(cmd: vk::CommandBuffer) -> Self {
        Self {
            command_buffers: vec![cmd],
            ..Self::default()
        }
    }

    /// Wait on `semaphore` before `stage` executes.
    #[must_use]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
        self
    }

    /// Signal `semaphore` when the batch completes.
    #[must_use]
    pub fn signal(mut self, semaphore: vk::Semaphore) -> Self {
        self.signal_semaphores.push(semaphore);
        self
    }
}

/// Device operations required by [`crate::command::CommandQueueManager`].
pub trait QueueDevice {
    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// Block until `fence` signals or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn queue_submit(&self, queue: &QueueHandle, batch: &SubmitBatch, fence: vk::Fence)
        -> Result<()>;

    /// Destroy a buffer whose last GPU use has completed.
    fn release_buffer(&self, buffer: GpuBuffer) -> Result<()>;

    /// Destroy a texture whose last GPU use has completed.
    fn release_texture(&self, texture: Texture) -> Result<()>;

    /// Attach a debug name to a Vulkan object.
    fn set_object_name(&self, _object_type: vk::ObjectType, _raw_handle: u64, _name: &str) {}

    /// Destroy the pool, its command buffers and the fences.
    fn destroy_queue_objects(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
        fences: &[vk::Fence],
    );
}

/// [`QueueDevice`] backed by a Vulkan device and the shared allocator.
#[derive(Clone)]
pub struct VulkanQueueDevice {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    debug_utils: Option<Arc<ash::ext::debug_utils::Device>>,
}

impl VulkanQueueDevice {
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        debug_utils: Option<Arc<ash::ext::debug_utils::Device>>,
    ) -> Self {
        Self {
            device,
            allocator,
            debug_utils,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_deref()
    }
}

impl QueueDevice for VulkanQueueDevice {
    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        unsafe { crate::sync::create_fence(&self.device, signaled) }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { crate::sync::reset_fence(&self.device, fence) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;
        }
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn queue_submit(
        &self,
        queue: &QueueHandle,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&batch.command_buffers)
            .wait_semaphores(&batch.wait_semaphores)
            .wait_dst_stage_mask(&batch.wait_stages)
            .signal_semaphores(&batch.signal_semaphores);

        queue.with_lock(|raw| unsafe { self.device.queue_submit(raw, &[submit_info], fence) })?;
        Ok(())
    }

    fn release_buffer(&self, mut buffer: GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(&mut buffer)
    }

    fn release_texture(&self, texture: Texture) -> Result<()> {
        texture.destroy(&self.device, &mut self.allocator.lock())
    }

    fn set_object_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: raw_handle,
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("Failed to name {object_type:?}: {e}");
        }
    }

    fn destroy_queue_objects(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
        fences: &[vk::Fence],
    ) {
        unsafe {
            for &fence in fences {
                self.device.destroy_fence(fence, None);
            }
            if !command_buffers.is_empty() {
                self.device.free_command_buffers(pool, command_buffers);
            }
            self.device.destroy_command_pool(pool, None);
        }
    }
}

/// Lets several managers share one device, as the upload threads do.
impl<D: QueueDevice + ?Sized> QueueDevice for Arc<D> {
    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        (**self).create_command_pool(queue_family, flags)
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        (**self).allocate_command_buffers(pool, count)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        (**self).create_fence(signaled)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait> {
        (**self).wait_for_fence(fence, timeout_ns)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        (**self).reset_fence(fence)
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        (**self).reset_command_buffer(cmd)
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        (**self).begin_command_buffer(cmd, flags)
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        (**self).end_command_buffer(cmd)
    }

    fn queue_submit(
        &self,
        queue: &QueueHandle,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> Result<()> {
        (**self).queue_submit(queue, batch, fence)
    }

    fn release_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        (**self).release_buffer(buffer)
    }

    fn release_texture(&self, texture: Texture) -> Result<()> {
        (**self).release_texture(texture)
    }

    fn set_object_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        (**self).set_object_name(object_type, raw_handle, name);
    }

    fn destroy_queue_objects(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
        fences: &[vk::Fence],
    ) {
        (**self).destroy_queue_objects(pool, command_buffers, fences);
    }
}
