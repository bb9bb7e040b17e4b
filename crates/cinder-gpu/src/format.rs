//! Format queries.

use ash::vk;

/// Size of one texel in bytes, for uncompressed formats.
pub fn bytes_per_pixel(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UINT
        | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8_UNORM | vk::Format::D16_UNORM_S8_UINT => 3,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::D32_SFLOAT_S8_UINT => 5,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// True for formats with a depth aspect.
pub fn is_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::X8_D24_UNORM_PACK32
    )
}

/// True for formats with a stencil aspect.
pub fn is_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspects addressed by barriers and views of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match (is_depth(format), is_stencil(format)) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        (false, true) => vk::ImageAspectFlags::STENCIL,
        (false, false) => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn pixel_sizes() {
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(bytes_per_pixel(vk::Format::BC7_SRGB_BLOCK), None);
    }
}
