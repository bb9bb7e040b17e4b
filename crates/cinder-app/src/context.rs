//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use cinder_gpu::{
    CommandQueueManager, FrameSemaphoreRing, GpuContext, ResourceTable, SurfaceContext, Swapchain,
};
use winit::window::Window;

/// Command buffers and semaphore slots for `image_count` swapchain images
/// with at most `frames_in_flight` frames outstanding.
///
/// Returns `(count, concurrent_num_commands)` for the graphics queue manager.
pub fn frame_ring_sizes(image_count: usize, frames_in_flight: usize) -> (usize, usize) {
    let concurrent = frames_in_flight.max(1);
    (image_count.max(concurrent), concurrent)
}

/// Semaphore ring length needed after the swapchain changes to
/// `image_count` images, or `None` when the `current` ring still covers it.
pub fn grown_semaphore_ring_len(
    current: usize,
    image_count: usize,
    frames_in_flight: usize,
) -> Option<usize> {
    let (needed, _) = frame_ring_sizes(image_count, frames_in_flight);
    (needed > current).then_some(needed)
}

/// Everything an application needs to record and submit frames.
///
/// Passed explicitly to every [`crate::CinderApp`] method.
pub struct AppContext {
    pub window: Arc<Window>,
    pub gpu: Arc<GpuContext>,
    pub surface: SurfaceContext,
    pub swapchain: Swapchain,
    /// Graphics queue manager the frame loop records and submits through.
    pub graphics: CommandQueueManager,
    /// Buffers and textures shared between passes.
    pub resources: ResourceTable,
    /// `image_available` indexed by frame slot, `render_finished` by
    /// swapchain image.
    pub(crate) semaphores: FrameSemaphoreRing,
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
    pub vsync: bool,
}

impl AppContext {
    /// # Safety
    /// The window must outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: Arc<GpuContext>,
        vsync: bool,
        frames_in_flight: usize,
    ) -> anyhow::Result<Self> {
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let swapchain = unsafe {
            surface.create_swapchain(&gpu, size.width.max(1), size.height.max(1), vsync, None)?
        };
        tracing::info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            images = swapchain.image_count(),
            "Swapchain created"
        );

        let (count, concurrent) = frame_ring_sizes(swapchain.image_count(), frames_in_flight);
        let graphics = gpu.create_graphics_command_queue(count, concurrent, "frame")?;
        let semaphores = unsafe { FrameSemaphoreRing::new(gpu.device(), count)? };

        Ok(Self {
            window,
            gpu,
            surface,
            swapchain,
            graphics,
            resources: ResourceTable::new(),
            semaphores,
            frame_count: 0,
            last_frame_time: Instant::now(),
            vsync,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn width(&self) -> u32 {
        self.swapchain.extent.width
    }

    pub fn height(&self) -> u32 {
        self.swapchain.extent.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    pub fn frames_in_flight(&self) -> usize {
        self.graphics.concurrent_num_commands()
    }

    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.swapchain = unsafe {
            self.surface
                .recreate_swapchain(&self.gpu, &mut self.swapchain, width, height, self.vsync)?
        };
        tracing::info!(
            width = self.swapchain.extent.width,
            height = self.swapchain.extent.height,
            images = self.swapchain.image_count(),
            "Swapchain recreated"
        );

        // render_finished is indexed by swapchain image
        if let Some(len) = grown_semaphore_ring_len(
            self.semaphores.len(),
            self.swapchain.image_count(),
            self.frames_in_flight(),
        ) {
            let device = self.gpu.device();
            let grown = unsafe { FrameSemaphoreRing::new(device, len)? };
            let mut old = std::mem::replace(&mut self.semaphores, grown);
            unsafe { old.destroy(device) };
            tracing::debug!(len, "Semaphore ring grown");
        }
        Ok(())
    }

    /// Free what the frame loop owns. Resources left in the table are
    /// retired through the graphics manager, which then waits and releases
    /// them.
    ///
    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn cleanup(&mut self) -> anyhow::Result<()> {
        self.resources.retire_all(&mut self.graphics);
        self.graphics.destroy()?;

        let device = self.gpu.device();
        unsafe {
            self.semaphores.destroy(device);
            self.swapchain.destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_covers_every_swapchain_image() {
        assert_eq!(frame_ring_sizes(3, 2), (3, 2));
        assert_eq!(frame_ring_sizes(2, 2), (2, 2));
    }

    #[test]
    fn frames_in_flight_never_exceed_the_ring() {
        assert_eq!(frame_ring_sizes(2, 4), (4, 4));
        assert_eq!(frame_ring_sizes(3, 0), (3, 1));
    }

    #[test]
    fn ring_grows_only_when_the_swapchain_gains_images() {
        assert_eq!(grown_semaphore_ring_len(3, 3, 2), None);
        assert_eq!(grown_semaphore_ring_len(3, 2, 2), None);
        assert_eq!(grown_semaphore_ring_len(3, 5, 2), Some(5));
        assert_eq!(grown_semaphore_ring_len(2, 2, 4), Some(4));
    }
}
