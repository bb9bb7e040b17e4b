//! Procedural demo scene: a square grid of textured cubes.

use cinder_core::{DecodedImage, Material, Mesh, Model, Vertex};
use glam::Vec3;

/// Side length of each generated checker texture.
pub const TEXTURE_SIZE: u32 = 64;

const CUBE_HALF_SIZE: f32 = 0.4;
const SPACING: f32 = 1.5;

/// Cube faces as (outward normal, right axis). Up is `normal x right`, so the
/// corners below wind counter-clockwise seen from outside.
const FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Z),
    (Vec3::NEG_X, Vec3::Z),
    (Vec3::Y, Vec3::X),
    (Vec3::NEG_Y, Vec3::X),
    (Vec3::Z, Vec3::X),
    (Vec3::NEG_Z, Vec3::NEG_X),
];

/// Build `grid * grid` cubes centered on the origin in the XZ plane.
///
/// Cube `i` uses material `i % textures`, and material `m` samples texture
/// `m`. With `textures == 0` every cube is untextured.
pub fn build_grid_scene(grid: u32, textures: u32) -> Model {
    let offset = (grid.saturating_sub(1)) as f32 * SPACING * 0.5;

    let meshes = (0..grid * grid)
        .map(|i| {
            let center = Vec3::new(
                (i % grid) as f32 * SPACING - offset,
                0.0,
                (i / grid) as f32 * SPACING - offset,
            );
            let material = if textures == 0 { -1 } else { (i % textures) as i32 };
            cube(center, CUBE_HALF_SIZE, material)
        })
        .collect();

    let materials = (0..textures)
        .map(|i| Material {
            base_color_texture: i as i32,
            ..Material::default()
        })
        .collect();

    let textures = (0..textures).map(|i| checker_texture(i, TEXTURE_SIZE)).collect();

    Model {
        meshes,
        materials,
        textures,
    }
}

/// Half the distance across the grid, for placing the camera.
pub fn grid_radius(grid: u32) -> f32 {
    grid as f32 * SPACING * 0.5
}

/// Material slots whose base color samples texture `texture_index`.
pub fn material_slots_for_texture(model: &Model, texture_index: u32) -> Vec<u32> {
    model
        .materials
        .iter()
        .enumerate()
        .filter(|(_, material)| material.base_color_texture == texture_index as i32)
        .map(|(slot, _)| slot as u32)
        .collect()
}

fn cube(center: Vec3, half: f32, material: i32) -> Mesh {
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, right) in FACES {
        let up = normal.cross(right);
        let base = vertices.len() as u32;
        let face_center = center + normal * half;
        for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = face_center + (right * u + up * v) * half;
            let uv = [(u + 1.0) * 0.5, (1.0 - v) * 0.5];
            vertices.push(Vertex::new(position.to_array(), normal.to_array(), uv));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    Mesh {
        vertices,
        indices,
        material,
    }
}

/// A two-tone checkerboard whose hue depends on `seed`.
fn checker_texture(seed: u32, size: u32) -> DecodedImage {
    let hue = seed as f32 * 0.618_034;
    let channel = |phase: f32| {
        let c = (hue + phase).fract();
        (64.0 + 191.0 * (c * std::f32::consts::TAU).sin().abs()) as u8
    };
    let tint = [channel(0.0), channel(0.33), channel(0.67)];

    let image = image::RgbaImage::from_fn(size, size, |x, y| {
        if ((x / 8) + (y / 8)) % 2 == 0 {
            image::Rgba([tint[0], tint[1], tint[2], 255])
        } else {
            image::Rgba([tint[0] / 3, tint[1] / 3, tint[2] / 3, 255])
        }
    });

    DecodedImage {
        width: size,
        height: size,
        pixels: image.into_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_has_one_cube_per_cell() {
        let model = build_grid_scene(4, 3);
        assert_eq!(model.meshes.len(), 16);
        assert!(model.meshes.iter().all(|m| m.vertices.len() == 24));
        assert!(model.meshes.iter().all(|m| m.indices.len() == 36));
        assert_eq!(model.textures.len(), 3);
    }

    #[test]
    fn materials_cycle_through_textures() {
        let model = build_grid_scene(3, 4);
        let materials: Vec<i32> = model.meshes.iter().map(|m| m.material).collect();
        assert_eq!(materials, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
        assert_eq!(material_slots_for_texture(&model, 2), vec![2]);
        assert!(material_slots_for_texture(&model, 7).is_empty());
    }

    #[test]
    fn untextured_scene_has_no_materials() {
        let model = build_grid_scene(2, 0);
        assert!(model.meshes.iter().all(|m| m.material == -1));
        assert!(model.materials.is_empty());
        assert!(model.textures.is_empty());
    }

    #[test]
    fn faces_wind_counter_clockwise_from_outside() {
        let mesh = cube(Vec3::ZERO, 1.0, -1);
        for tri in mesh.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| mesh.vertices[i as usize]);
            let (pa, pb, pc) = (
                Vec3::from_array(a.position),
                Vec3::from_array(b.position),
                Vec3::from_array(c.position),
            );
            let facing = (pb - pa).cross(pc - pa).dot(Vec3::from_array(a.normal));
            assert!(facing > 0.0);
        }
    }

    #[test]
    fn grid_is_centered_on_the_origin() {
        let model = build_grid_scene(5, 1);
        let sum: Vec3 = model.meshes.iter().map(|m| m.bounds().center()).sum();
        assert!(sum.length() < 1e-3);
    }

    #[test]
    fn checker_texture_is_tightly_packed_rgba() {
        let texture = checker_texture(5, 16);
        assert_eq!(texture.byte_len(), 16 * 16 * 4);
        assert!(texture.pixels.chunks(4).all(|px| px[3] == 255));
    }
}
