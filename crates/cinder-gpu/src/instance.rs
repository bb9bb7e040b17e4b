//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_void, CStr, CString};

/// Instance extensions needed for presentation on this platform.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan 1.3 instance.
///
/// With `enable_validation`, the Khronos validation layer and
/// `VK_EXT_debug_utils` are enabled when available. Returns whether debug
/// utils were enabled.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Cinder")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = required_instance_extensions();

    let mut layers = Vec::new();
    let mut debug_utils = false;
    if enable_validation {
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let has_validation = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if has_validation {
            layers.push(VALIDATION_LAYER);
        } else {
            tracing::warn!("Validation layer {VALIDATION_LAYER:?} not available");
        }

        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
        debug_utils = available_extensions.iter().any(|props| {
            props
                .extension_name_as_c_str()
                .is_ok_and(|name| name == ash::ext::debug_utils::NAME)
        });
        if debug_utils {
            extensions.push(ash::ext::debug_utils::NAME);
        }
    }

    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();
    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok((instance, debug_utils))
}

/// Create a messenger forwarding validation output into `tracing`.
///
/// # Safety
/// The instance must have `VK_EXT_debug_utils` enabled.
pub unsafe fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));
    Ok(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? })
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        unsafe { (*callback_data).message_as_c_str() }
            .map_or(std::borrow::Cow::Borrowed("<no message>"), CStr::to_string_lossy)
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?message_type, "{message}");
    } else {
        tracing::debug!(target: "vulkan", ?message_type, "{message}");
    }
    vk::FALSE
}

/// Pick the highest scoring physical device that supports Vulkan 1.3.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        .map(|device| (unsafe { score_physical_device(instance, device) }, device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // GPU-driven culling needs drawIndirectCount
    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    if vulkan_1_2.draw_indirect_count == vk::TRUE {
        score += 500;
    }

    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024 * 1024))
        .sum();

    score + vram_gb as i64
}
