//! Synchronization primitives.
//!
//! Fences belong to [`crate::command::CommandQueueManager`]; this module holds
//! the raw constructors and the per-frame semaphores used for presentation.

use crate::error::Result;
use ash::vk;

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(unsafe { device.create_semaphore(&create_info, None)? })
}

/// Create a fence, optionally already signaled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(unsafe { device.create_fence(&create_info, None)? })
}

/// Reset a fence to the unsignaled state.
///
/// # Safety
/// The device and fence must be valid and the fence must not be in flight.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Semaphores linking acquire, render and present for one frame slot.
pub struct FrameSemaphores {
    /// Signaled when the swapchain image is ready to be written.
    pub image_available: vk::Semaphore,
    /// Signaled when rendering finished; presentation waits on it.
    pub render_finished: vk::Semaphore,
}

/// One [`FrameSemaphores`] per concurrent frame, cycled with the graphics
/// queue manager's slot index.
pub struct FrameSemaphoreRing {
    frames: Vec<FrameSemaphores>,
}

impl FrameSemaphoreRing {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, frames_in_flight: usize) -> Result<Self> {
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            frames.push(FrameSemaphores {
                image_available: unsafe { create_semaphore(device)? },
                render_finished: unsafe { create_semaphore(device)? },
            });
        }
        Ok(Self { frames })
    }

    /// Semaphores for the frame slot `index`, wrapping around.
    pub fn get(&self, index: usize) -> &FrameSemaphores {
        &self.frames[index % self.frames.len()]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// # Safety
    /// No submission may still reference the semaphores.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for frame in self.frames.drain(..) {
            unsafe {
                device.destroy_semaphore(frame.image_available, None);
                device.destroy_semaphore(frame.render_finished, None);
            }
        }
    }
}
