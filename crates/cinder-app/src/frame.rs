//! Per-frame context for rendering.

use ash::vk;

/// The frame being recorded.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Begun command buffer from the graphics queue manager.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Frame-in-flight slot, for per-frame ring buffers.
    pub frame_slot: usize,
    pub dt: f32,
    pub frame_number: u64,
}
