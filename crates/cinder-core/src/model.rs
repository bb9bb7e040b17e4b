//! CPU-side model description.
//!
//! Asset loaders produce a [`Model`]; the renderer flattens it into one
//! vertex buffer, one index buffer and one indirect draw command per mesh.

use crate::error::{Error, Result};
use crate::math::Aabb;
use crate::types::{IndirectDrawCommandAndMeshData, MeshBoundingBox, Vertex};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// A single mesh with its own vertex and index arrays.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Index into [`Model::materials`], or -1 for none
    pub material: i32,
}

impl Mesh {
    /// World-space bounds of the mesh vertices.
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(v.position)))
            .unwrap_or_default()
    }
}

/// Material parameters in the layout the fragment shader reads (std430).
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Material {
    pub base_color: [f32; 4],
    /// Index into the texture array, or -1 for an untextured material
    pub base_color_texture: i32,
    pub _padding: [i32; 3],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            base_color_texture: -1,
            _padding: [0; 3],
        }
    }
}

/// Decoded RGBA8 pixels.
#[derive(Clone, Debug, Default)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// Size of the pixel data in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Meshes, materials and decoded textures of one scene.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub textures: Vec<DecodedImage>,
}

impl Model {
    /// All mesh vertices concatenated in mesh order.
    pub fn merged_vertices(&self) -> Vec<Vertex> {
        self.meshes
            .iter()
            .flat_map(|mesh| mesh.vertices.iter().copied())
            .collect()
    }

    /// All mesh indices concatenated in mesh order, each relative to its mesh.
    pub fn merged_indices(&self) -> Vec<u32> {
        self.meshes
            .iter()
            .flat_map(|mesh| mesh.indices.iter().copied())
            .collect()
    }

    /// One indirect draw per mesh addressing the merged buffers.
    pub fn indirect_draw_commands(&self) -> Vec<IndirectDrawCommandAndMeshData> {
        let mut first_index = 0u32;
        let mut vertex_offset = 0i32;
        self.meshes
            .iter()
            .enumerate()
            .map(|(mesh_id, mesh)| {
                let command = IndirectDrawCommandAndMeshData {
                    index_count: mesh.indices.len() as u32,
                    instance_count: 1,
                    first_index,
                    vertex_offset,
                    first_instance: 0,
                    mesh_id: mesh_id as u32,
                    material_index: mesh.material,
                };
                first_index += mesh.indices.len() as u32;
                vertex_offset += mesh.vertices.len() as i32;
                command
            })
            .collect()
    }

    /// Bounding box of every mesh, indexed by mesh id.
    pub fn mesh_bounding_boxes(&self) -> Vec<MeshBoundingBox> {
        self.meshes
            .iter()
            .map(|mesh| MeshBoundingBox::from_aabb(&mesh.bounds()))
            .collect()
    }

    /// Check every cross reference the renderer relies on: indices within
    /// their mesh, materials and textures within the model, and texture
    /// pixel buffers matching their size.
    pub fn validate(&self) -> Result<()> {
        for mesh in &self.meshes {
            if let Some(&index) = mesh.indices.iter().find(|&&i| i as usize >= mesh.vertices.len()) {
                return Err(Error::OutOfBounds {
                    what: "vertex",
                    index: i64::from(index),
                    len: mesh.vertices.len(),
                });
            }
            if mesh.material >= 0 && mesh.material as usize >= self.materials.len() {
                return Err(Error::OutOfBounds {
                    what: "material",
                    index: i64::from(mesh.material),
                    len: self.materials.len(),
                });
            }
        }

        for material in &self.materials {
            let texture = material.base_color_texture;
            if texture >= 0 && texture as usize >= self.textures.len() {
                return Err(Error::OutOfBounds {
                    what: "texture",
                    index: i64::from(texture),
                    len: self.textures.len(),
                });
            }
        }

        for (i, image) in self.textures.iter().enumerate() {
            let expected = image.width as usize * image.height as usize * 4;
            if image.width == 0 || image.height == 0 || image.byte_len() != expected {
                return Err(Error::InvalidData(format!(
                    "texture {i} is {}x{} but holds {} bytes",
                    image.width,
                    image.height,
                    image.byte_len()
                )));
            }
        }
        Ok(())
    }

    /// Total index count across all meshes.
    pub fn index_count(&self) -> usize {
        self.meshes.iter().map(|mesh| mesh.indices.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(offset: f32, material: i32) -> Mesh {
        Mesh {
            vertices: vec![
                Vertex::new([offset, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
                Vertex::new([offset + 1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
                Vertex::new([offset, 2.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
            ],
            indices: vec![0, 1, 2],
            material,
        }
    }

    #[test]
    fn draw_commands_address_merged_buffers() {
        let model = Model {
            meshes: vec![triangle(0.0, 0), triangle(5.0, -1)],
            ..Model::default()
        };
        let commands = model.indirect_draw_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].first_index, 3);
        assert_eq!(commands[1].vertex_offset, 3);
        assert_eq!(commands[1].mesh_id, 1);
        assert_eq!(commands[1].material_index, -1);
        assert_eq!(model.merged_vertices().len(), 6);
        assert_eq!(model.merged_indices(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(model.index_count(), 6);
    }

    #[test]
    fn mesh_bounds_follow_vertices() {
        let model = Model {
            meshes: vec![triangle(5.0, 0)],
            ..Model::default()
        };
        let bbox = model.mesh_bounding_boxes()[0];
        assert_eq!(bbox.center(), Vec3::new(5.5, 1.0, 0.0));
        assert_eq!(bbox.extents(), Vec3::new(0.5, 1.0, 0.0));
    }

    #[test]
    fn validate_rejects_dangling_references() {
        let mut model = Model {
            meshes: vec![triangle(0.0, 0)],
            materials: vec![Material::default()],
            ..Model::default()
        };
        assert_eq!(model.validate(), Ok(()));

        model.meshes[0].material = 1;
        assert!(matches!(
            model.validate(),
            Err(Error::OutOfBounds { what: "material", index: 1, len: 1 })
        ));

        model.meshes[0].material = 0;
        model.materials[0].base_color_texture = 0;
        assert!(matches!(
            model.validate(),
            Err(Error::OutOfBounds { what: "texture", .. })
        ));

        model.materials[0].base_color_texture = -1;
        model.meshes[0].indices.push(3);
        assert!(matches!(
            model.validate(),
            Err(Error::OutOfBounds { what: "vertex", index: 3, len: 3 })
        ));
    }

    #[test]
    fn validate_checks_texture_byte_length() {
        let model = Model {
            textures: vec![DecodedImage {
                width: 2,
                height: 2,
                pixels: vec![0; 12],
            }],
            ..Model::default()
        };
        assert!(matches!(model.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn material_matches_std430_layout() {
        assert_eq!(std::mem::size_of::<Material>(), 32);
    }
}
