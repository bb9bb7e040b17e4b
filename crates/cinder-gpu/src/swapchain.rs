//! Swapchain whose images are tracked as [`Texture`]s.
//!
//! Presentation changes image layouts outside the command stream, so after
//! each present the image's tracked layout is set to `PRESENT_SRC_KHR` and
//! the next frame's transition starts from there.

use crate::device::QueueHandle;
use crate::error::{GpuError, Result};
use crate::texture::{create_image_view, Texture};
use ash::vk;

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    images: Vec<Texture>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain and wrap its images.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let image_count = desired_image_count(surface_capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or_default());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let raw_images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };
        let mut images = Vec::with_capacity(raw_images.len());
        for (i, image) in raw_images.into_iter().enumerate() {
            let view = unsafe {
                create_image_view(
                    device,
                    image,
                    surface_format.format,
                    vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                )?
            };
            images.push(Texture::wrap_external(
                image,
                view,
                surface_format.format,
                extent,
                format!("swapchain {i}"),
            ));
        }

        tracing::debug!(
            images = images.len(),
            ?present_mode,
            width = extent.width,
            height = extent.height,
            "Created swapchain"
        );

        Ok(Self {
            swapchain,
            images,
            format: surface_format.format,
            extent,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> &Texture {
        &self.images[index as usize]
    }

    pub fn image_mut(&mut self, index: u32) -> &mut Texture {
        &mut self.images[index as usize]
    }

    /// Acquire the next image, signaling `semaphore` when it is writable.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    /// `ERROR_OUT_OF_DATE_KHR` is returned as an error and means no image
    /// was acquired.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        Ok(unsafe {
            swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )?
        })
    }

    /// Present `image_index` after `wait_semaphores`.
    ///
    /// Returns true when the swapchain should be recreated.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &mut self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: &QueueHandle,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result =
            queue.with_lock(|raw| unsafe { swapchain_loader.queue_present(raw, &present_info) });
        self.images[image_index as usize].set_image_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for image in self.images.drain(..) {
            unsafe { device.destroy_image_view(image.view(), None) };
        }
        unsafe { swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}

/// One more image than the minimum, within the surface's maximum.
pub fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Prefer BGRA8 sRGB, otherwise the first supported format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("Surface reports no formats".to_string()))
}

/// FIFO with vsync, otherwise mailbox, then immediate, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's extent when fixed, otherwise clamp the window size.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_mode_preference() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(select_surface_format(&[unorm, srgb]).unwrap().format, srgb.format);
        assert_eq!(select_surface_format(&[unorm]).unwrap().format, unorm.format);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn extent_and_image_count() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        assert_eq!(desired_image_count(&caps), 2);
        let extent = calculate_extent(&caps, 4000, 600);
        assert_eq!((extent.width, extent.height), (1920, 600));
    }
}
