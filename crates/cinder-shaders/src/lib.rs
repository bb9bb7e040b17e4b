//! SPIR-V for the Cinder renderer.
//!
//! GLSL sources live in `shaders/` and are compiled by the build script with
//! shaderc. Each accessor returns word-aligned SPIR-V ready for
//! `vkCreateShaderModule`.

use std::sync::OnceLock;

/// Size of the material texture array in `indirect_draw.frag`.
pub const MAX_MATERIAL_TEXTURES: u32 = 64;

/// Threads per workgroup in `gpu_culling.comp`.
pub const CULLING_LOCAL_SIZE: u32 = 256;

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    pub static GPU_CULLING_COMP: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/gpu_culling.spv"));
    pub static INDIRECT_DRAW_VERT: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/indirect_draw_vert.spv"));
    pub static INDIRECT_DRAW_FRAG: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/indirect_draw_frag.spv"));
}

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    assert!(
        bytes.len() % 4 == 0,
        "SPIR-V bytecode must be 4-byte aligned"
    );
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

static GPU_CULLING_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static INDIRECT_DRAW_VERT_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static INDIRECT_DRAW_FRAG_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();

/// Frustum culling compute shader.
pub fn gpu_culling_shader() -> &'static [u32] {
    GPU_CULLING_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::GPU_CULLING_COMP))
}

pub fn indirect_draw_vertex_shader() -> &'static [u32] {
    INDIRECT_DRAW_VERT_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::INDIRECT_DRAW_VERT))
}

pub fn indirect_draw_fragment_shader() -> &'static [u32] {
    INDIRECT_DRAW_FRAG_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::INDIRECT_DRAW_FRAG))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn shaders_load() {
        for shader in [
            gpu_culling_shader(),
            indirect_draw_vertex_shader(),
            indirect_draw_fragment_shader(),
        ] {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 50, "Shader too small");
        }
    }
}
