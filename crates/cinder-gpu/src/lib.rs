//! Vulkan layer for the Cinder renderer.
//!
//! This crate provides:
//! - Instance, device and queue setup with capability gating
//! - Memory allocation via gpu-allocator, staging uploads and a handle arena
//! - Textures with tracked layouts, mip generation and queue ownership transfer
//! - [`CommandQueueManager`]: command buffer and fence rings with fence-gated
//!   disposal of resources used by in-flight work
//! - Descriptor, pipeline and swapchain helpers

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod format;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod ownership;
pub mod pipeline;
pub mod recorder;
pub mod resources;
pub mod ring_buffer;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandQueueConfig, CommandQueueManager};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use device::{FenceWait, QueueDevice, QueueHandle, SubmitBatch, VulkanQueueDevice};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use ownership::QueueOwnershipTransfer;
pub use pipeline::{ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig, VertexLayout};
pub use recorder::{CommandEncoder, CommandRecorder};
pub use resources::{BufferHandle, ResourceTable, TextureHandle};
pub use ring_buffer::RingBuffer;
pub use staging::StagingBuffer;
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore, FrameSemaphoreRing, FrameSemaphores};
pub use texture::{MipPolicy, Texture, TextureDesc};
