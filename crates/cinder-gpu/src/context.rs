//! GPU context: device, queues, allocator and the factories built on them.

use crate::capabilities::GpuCapabilities;
use crate::command::{CommandQueueConfig, CommandQueueManager};
use crate::device::{QueueDevice, QueueHandle, VulkanQueueDevice};
use crate::error::{GpuError, Result};
use crate::instance::{create_debug_messenger, create_instance, select_physical_device};
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::recorder::{CommandEncoder, CommandRecorder};
use crate::staging::StagingBuffer;
use crate::texture::{create_image_view, Texture, TextureDesc};
use ash::vk;
use ash::vk::Handle;
use cinder_core::constants::DEFAULT_FENCE_TIMEOUT_NS;
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    debug_utils: Option<Arc<ash::ext::debug_utils::Device>>,
    capabilities: GpuCapabilities,
    allocator: Arc<Mutex<GpuAllocator>>,

    graphics_queue: QueueHandle,
    compute_queue: QueueHandle,
    transfer_queue: QueueHandle,

    fence_timeout_ns: u64,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The allocator shared by every manager and upload thread.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_deref()
    }

    /// Graphics queue. Shares its lock with any other role on the same family.
    pub fn graphics_queue(&self) -> &QueueHandle {
        &self.graphics_queue
    }

    pub fn compute_queue(&self) -> &QueueHandle {
        &self.compute_queue
    }

    pub fn transfer_queue(&self) -> &QueueHandle {
        &self.transfer_queue
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ns
    }

    /// Device operations for a [`CommandQueueManager`].
    pub fn queue_device(&self) -> VulkanQueueDevice {
        VulkanQueueDevice::new(
            Arc::clone(&self.device),
            Arc::clone(&self.allocator),
            self.debug_utils.clone(),
        )
    }

    /// Recorder for `cmd`, which must be in the recording state.
    ///
    /// Unlike [`CommandQueueManager::encoder`] this borrows only the context,
    /// so the manager stays free for deferred disposal while recording.
    pub fn encoder(&self, cmd: vk::CommandBuffer) -> CommandEncoder<'_> {
        unsafe { CommandEncoder::new(&self.device, self.debug_utils.as_deref(), cmd) }
    }

    /// A command queue manager on `queue`.
    pub fn create_command_queue(
        &self,
        queue: &QueueHandle,
        count: usize,
        concurrent_num_commands: usize,
        name: &str,
    ) -> Result<CommandQueueManager> {
        let config = CommandQueueConfig::new(count, concurrent_num_commands, name)
            .with_fence_timeout_ns(self.fence_timeout_ns);
        CommandQueueManager::new(self.queue_device(), queue.clone(), config)
    }

    pub fn create_graphics_command_queue(
        &self,
        count: usize,
        concurrent_num_commands: usize,
        name: &str,
    ) -> Result<CommandQueueManager> {
        self.create_command_queue(&self.graphics_queue, count, concurrent_num_commands, name)
    }

    pub fn create_transfer_command_queue(
        &self,
        count: usize,
        concurrent_num_commands: usize,
        name: &str,
    ) -> Result<CommandQueueManager> {
        self.create_command_queue(&self.transfer_queue, count, concurrent_num_commands, name)
    }

    /// Allocate a buffer and label it for debuggers.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer = self
            .allocator
            .lock()
            .create_buffer(size, usage, location, name)?;
        self.set_object_name(buffer.buffer, name);
        Ok(buffer)
    }

    /// Device-local buffer that can be filled by staging copies.
    pub fn create_gpu_only_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )
    }

    /// Host-visible buffer for copies to the GPU.
    pub fn create_staging_buffer(&self, size: u64, name: &str) -> Result<GpuBuffer> {
        self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            name,
        )
    }

    /// Staging buffer the size of `destination`, bound to it.
    pub fn create_staging_for(&self, destination: &GpuBuffer, name: &str) -> Result<StagingBuffer> {
        let buffer = self.create_staging_buffer(destination.size, name)?;
        Ok(StagingBuffer::new(buffer, destination))
    }

    /// Record a staged copy of `data` into the start of `destination`.
    ///
    /// The staging memory is handed to `manager` and freed once the current
    /// submission completes.
    pub fn upload_to_gpu_buffer<D: QueueDevice>(
        &self,
        manager: &mut CommandQueueManager<D>,
        rec: &mut dyn CommandRecorder,
        destination: &GpuBuffer,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let buffer = self.create_staging_buffer(data.len() as u64, "upload staging")?;
        let staging = StagingBuffer::new(buffer, destination);
        staging.copy_data_to_buffer(data)?;
        staging.upload_staging_buffer_to_gpu(rec, 0, 0);
        manager.dispose_when_submit_completes(staging.into_buffer());
        Ok(())
    }

    /// True when `format` supports linear filtering in blits, as mip
    /// generation needs.
    pub fn format_supports_linear_blit(&self, format: vk::Format) -> bool {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        properties.optimal_tiling_features.contains(
            vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        )
    }

    /// Create an image, its memory and its primary view.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        let mip_levels = desc.mip_levels();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.image_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image =
            self.allocator
                .lock()
                .create_image(&create_info, MemoryLocation::GpuOnly, &desc.name)?;

        let range = vk::ImageSubresourceRange {
            aspect_mask: crate::format::aspect_mask(desc.format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        let view = match unsafe { create_image_view(&self.device, image.image, desc.format, range) }
        {
            Ok(view) => view,
            Err(e) => {
                self.allocator.lock().free_image(&mut image)?;
                return Err(e);
            }
        };
        self.set_object_name(image.image, &desc.name);

        let linear_blit = self.format_supports_linear_blit(desc.format);
        Ok(Texture::from_allocated(image, view, desc, linear_blit))
    }

    /// Linear, repeating sampler for material textures.
    pub fn create_sampler(&self) -> Result<vk::Sampler> {
        let anisotropy = self.capabilities.supports_sampler_anisotropy;
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { 8.0 } else { 1.0 })
            .max_lod(vk::LOD_CLAMP_NONE);
        Ok(unsafe { self.device.create_sampler(&info, None)? })
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { crate::sync::create_semaphore(&self.device) }
    }

    /// # Safety
    /// No pending submission may wait on or signal `semaphore`.
    pub unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    /// Label a Vulkan object when debug utils are enabled.
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        self.queue_device()
            .set_object_name(H::TYPE, handle.as_raw(), name);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocations must go before the device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    fence_timeout_ns: u64,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cinder".to_string(),
            enable_validation: cfg!(debug_assertions),
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers and debug labels.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Bound on fence waits for every manager created from the context.
    #[must_use]
    pub fn fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let (instance, debug_utils_enabled) =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let debug_messenger = if debug_utils_enabled {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { create_debug_messenger(&loader) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    tracing::warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        let missing = capabilities.missing_requirements();
        if !missing.is_empty() {
            return Err(GpuError::Unsupported(format!(
                "{} lacks {}",
                capabilities.device_name,
                missing.join(", ")
            )));
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = unsafe { find_queue_families(&instance, physical_device) }?;
        tracing::info!(
            graphics = queue_families.graphics,
            compute = queue_families.compute,
            transfer = queue_families.transfer,
            "Queue families"
        );

        let device = unsafe { create_device(&instance, physical_device, &queue_families, &capabilities)? };
        let device = Arc::new(device);

        // Roles on the same family share one VkQueue and one lock
        let mut queues: HashMap<u32, QueueHandle> = HashMap::new();
        let mut queue_for = |family: u32| {
            queues
                .entry(family)
                .or_insert_with(|| {
                    QueueHandle::new(unsafe { device.get_device_queue(family, 0) }, family)
                })
                .clone()
        };
        let graphics_queue = queue_for(queue_families.graphics);
        let compute_queue = queue_for(queue_families.compute);
        let transfer_queue = queue_for(queue_families.transfer);

        let debug_utils = debug_utils_enabled
            .then(|| Arc::new(ash::ext::debug_utils::Device::new(&instance, &device)));

        let allocator =
            unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            debug_utils,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            graphics_queue,
            compute_queue,
            transfer_queue,
            fence_timeout_ns: self.fence_timeout_ns,
        })
    }
}

struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families, preferring dedicated compute and transfer families.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let flags: Vec<vk::QueueFlags> = families.iter().map(|f| f.queue_flags).collect();
    pick_queue_families(&flags).ok_or(GpuError::NoSuitableDevice)
}

fn pick_queue_families(families: &[vk::QueueFlags]) -> Option<QueueFamilyIndices> {
    let find = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families.iter().position(|&f| pred(f)).map(|i| i as u32)
    };

    let graphics = find(&|f| f.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))?;
    let compute = find(&|f| f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS))
        .unwrap_or(graphics);
    let transfer = find(&|f| {
        f.contains(vk::QueueFlags::TRANSFER)
            && !f.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .unwrap_or(compute);

    Some(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
    capabilities: &GpuCapabilities,
) -> Result<ash::Device> {
    let unique_families: HashSet<u32> = [
        queue_families.graphics,
        queue_families.compute,
        queue_families.transfer,
    ]
    .into_iter()
    .collect();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .draw_indirect_count(capabilities.supports_draw_indirect_count)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut vulkan_1_1_features =
        vk::PhysicalDeviceVulkan11Features::default().shader_draw_parameters(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.supports_sampler_anisotropy)
        .multi_draw_indirect(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut vulkan_1_1_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(unsafe { instance.create_device(physical_device, &device_create_info, None)? })
}
