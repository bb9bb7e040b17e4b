//! GPU-shared data layouts.
//!
//! Every type here is `#[repr(C)]` and [`Pod`] so it can be copied into a
//! buffer byte-for-byte. Field order and sizes must match the GLSL
//! declarations in `cinder-shaders`.

use crate::math::{Aabb, Frustum};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// One indexed indirect draw plus the per-mesh data the shaders need.
///
/// The first five fields are exactly `VkDrawIndexedIndirectCommand`, so the
/// buffer can be consumed by `vkCmdDrawIndexedIndirectCount` with a stride of
/// `size_of::<Self>()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IndirectDrawCommandAndMeshData {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
    /// Index into the mesh bounding-box buffer
    pub mesh_id: u32,
    /// Index into the material table, or -1 for none
    pub material_index: i32,
}

impl IndirectDrawCommandAndMeshData {
    /// Byte stride between consecutive commands.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Per-mesh bounding box as read by the culling shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct MeshBoundingBox {
    /// Center in world space (w = 1)
    pub center: [f32; 4],
    /// Half-extents (w = 1)
    pub extents: [f32; 4],
}

impl MeshBoundingBox {
    /// Build from an AABB.
    pub fn from_aabb(aabb: &Aabb) -> Self {
        Self::new(aabb.center(), aabb.half_extents())
    }

    /// Build from center and half-extents.
    pub fn new(center: Vec3, extents: Vec3) -> Self {
        Self {
            center: center.extend(1.0).to_array(),
            extents: extents.extend(1.0).to_array(),
        }
    }

    /// Center as a vector.
    #[inline]
    pub fn center(&self) -> Vec3 {
        Vec3::new(self.center[0], self.center[1], self.center[2])
    }

    /// Half-extents as a vector.
    #[inline]
    pub fn extents(&self) -> Vec3 {
        Vec3::new(self.extents[0], self.extents[1], self.extents[2])
    }
}

/// Camera frustum planes, one uniform buffer per frame in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct FrustumUniform {
    pub planes: [[f32; 4]; 6],
}

impl From<&Frustum> for FrustumUniform {
    fn from(frustum: &Frustum) -> Self {
        Self {
            planes: frustum.to_arrays(),
        }
    }
}

/// Push constants of the culling compute shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CullingPushConstants {
    /// Number of entries in the unculled indirect buffer
    pub draw_count: u32,
}

/// Vertex layout of the indirect draw pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn indirect_command_prefix_matches_vulkan() {
        // VkDrawIndexedIndirectCommand is 20 bytes; mesh data follows it.
        assert_eq!(offset_of!(IndirectDrawCommandAndMeshData, first_instance), 16);
        assert_eq!(offset_of!(IndirectDrawCommandAndMeshData, mesh_id), 20);
        assert_eq!(size_of::<IndirectDrawCommandAndMeshData>(), 28);
        assert_eq!(IndirectDrawCommandAndMeshData::STRIDE, 28);
    }

    #[test]
    fn shader_struct_sizes() {
        assert_eq!(size_of::<MeshBoundingBox>(), 32);
        assert_eq!(size_of::<FrustumUniform>(), 96);
        assert_eq!(size_of::<CullingPushConstants>(), 4);
        assert_eq!(size_of::<Vertex>(), 32);
    }

    #[test]
    fn bounding_box_from_aabb() {
        let aabb = Aabb::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(3.0, 4.0, 6.0));
        let bbox = MeshBoundingBox::from_aabb(&aabb);
        assert_eq!(bbox.center, [1.0, 2.0, 4.0, 1.0]);
        assert_eq!(bbox.extents, [2.0, 2.0, 2.0, 1.0]);
        assert_eq!(bbox.center(), Vec3::new(1.0, 2.0, 4.0));
    }
}
