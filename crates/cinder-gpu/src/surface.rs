//! Window surface and swapchain factory.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window's Vulkan surface plus the surface and swapchain loaders.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                gpu.entry(),
                gpu.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                gpu.physical_device(),
                gpu.graphics_queue().family(),
                surface,
            )?
        };
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(GpuError::SurfaceCreation(
                "Graphics queue family cannot present to this surface".to_string(),
            ));
        }

        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        let physical_device = gpu.physical_device();
        unsafe {
            Ok(SurfaceCapabilities {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Create a swapchain sized to the window.
    ///
    /// # Safety
    /// `old_swapchain`, if any, must be retired but not yet destroyed.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let caps = self.capabilities(gpu)?;

        let surface_format = select_surface_format(&caps.formats)?;
        let present_mode = select_present_mode(&caps.present_modes, vsync);
        let extent = calculate_extent(&caps.capabilities, width, height);

        unsafe {
            Swapchain::new(
                gpu.device(),
                &self.swapchain_loader,
                self.surface,
                &caps.capabilities,
                surface_format,
                present_mode,
                extent,
                old_swapchain,
            )
        }
    }

    /// Replace `old` with a swapchain of the new size.
    ///
    /// # Safety
    /// No submission may still use `old`.
    pub unsafe fn recreate_swapchain(
        &self,
        gpu: &GpuContext,
        old: &mut Swapchain,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Swapchain> {
        let new = unsafe { self.create_swapchain(gpu, width, height, vsync, Some(old.swapchain))? };
        unsafe { old.destroy(gpu.device(), &self.swapchain_loader) };
        Ok(new)
    }

    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}
