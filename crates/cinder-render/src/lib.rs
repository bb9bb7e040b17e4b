//! GPU-driven rendering for the Cinder renderer.
//!
//! This crate provides:
//! - Scene upload into GPU-only vertex, index, draw and bounding-box buffers
//! - Compute frustum culling that compacts the draw list every frame
//! - An indirect-count graphics pass consuming the culled draws
//! - Background texture streaming with mip generation on the graphics queue
//! - Camera and view management

pub mod camera;
pub mod culling;
pub mod indirect_draw;
pub mod scene_upload;
pub mod uploader;

pub use camera::Camera;
pub use culling::{cull_on_cpu, CullingBindings, CullingComputePass, CullingConfig};
pub use indirect_draw::{DrawBindings, DrawPushConstants, IndirectDrawPass, DEPTH_FORMAT};
pub use cinder_shaders::MAX_MATERIAL_TEXTURES;
pub use scene_upload::{SceneBuffers, SceneData};
pub use uploader::{
    AsyncDataUploader, MipGenerationStage, ReadyTexture, TextureLoadTask, TextureMipGenTask,
    UploadStage, VulkanMipStage, VulkanUploadStage,
};
