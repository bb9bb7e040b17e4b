//! Core types, math, and asset contracts for the Cinder renderer.
//!
//! This crate provides the foundational types shared between the CPU side of
//! the renderer and its shaders:
//! - Frustum planes and bounding-box tests used by GPU culling
//! - `#[repr(C)]` structures laid out exactly as the shaders read them
//! - The CPU-side model description produced by asset loaders

pub mod error;
pub mod math;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use math::{Aabb, Frustum};
pub use model::{DecodedImage, Material, Mesh, Model};
pub use types::{
    CullingPushConstants, FrustumUniform, IndirectDrawCommandAndMeshData, MeshBoundingBox,
    Vertex,
};

/// Renderer-wide constants
pub mod constants {
    /// Threads per workgroup of the culling compute shader
    pub const CULLING_WORKGROUP_SIZE: u32 = 256;
    /// Number of planes bounding a view frustum
    pub const FRUSTUM_PLANE_COUNT: usize = 6;
    /// Default fence wait before a submission is treated as hung (5 seconds)
    pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 5_000_000_000;
}
