//! GPU capability detection.

use ash::vk;
use hashbrown::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// Dynamic rendering (Vulkan 1.3 core).
    pub supports_dynamic_rendering: bool,
    /// Synchronization2 (Vulkan 1.3 core).
    pub supports_synchronization2: bool,
    /// `vkCmdDrawIndexedIndirectCount` (Vulkan 1.2 `drawIndirectCount`).
    pub supports_draw_indirect_count: bool,
    /// Sampler anisotropy, used for material textures when present.
    pub supports_sampler_anisotropy: bool,

    /// Device-local memory in MB.
    pub device_local_memory_mb: u64,

    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_workgroup_invocations: u32,
    /// Upper bound for `drawCount` in indirect draws.
    pub max_draw_indirect_count: u32,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_2)
            .push_next(&mut vulkan_1_3);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        let base_features = features2.features;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
        };
        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
            supports_synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
            supports_draw_indirect_count: vulkan_1_2.draw_indirect_count == vk::TRUE,
            supports_sampler_anisotropy: base_features.sampler_anisotropy == vk::TRUE,

            device_local_memory_mb,

            max_compute_workgroup_size: properties.limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: properties.limits.max_compute_work_group_invocations,
            max_draw_indirect_count: properties.limits.max_draw_indirect_count,

            available_extensions,
        }
    }

    /// Required features this device lacks. Empty when the device is usable.
    pub fn missing_requirements(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            missing.push("Vulkan 1.3");
        }
        if !self.supports_dynamic_rendering {
            missing.push("dynamicRendering");
        }
        if !self.supports_synchronization2 {
            missing.push("synchronization2");
        }
        missing
    }

    pub fn meets_requirements(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// True when GPU-driven culling can feed `vkCmdDrawIndexedIndirectCount`.
    pub fn supports_gpu_culling(&self) -> bool {
        self.supports_draw_indirect_count
            && self.max_compute_workgroup_invocations >= cinder_core::constants::CULLING_WORKGROUP_SIZE
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - indirect count: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_draw_indirect_count { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: 1,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_draw_indirect_count: true,
            supports_sampler_anisotropy: true,
            device_local_memory_mb: 8192,
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            max_draw_indirect_count: u32::MAX,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements() {
        let caps = capable();
        assert!(caps.meets_requirements());
        assert!(caps.supports_gpu_culling());

        let old = GpuCapabilities {
            api_version: vk::make_api_version(0, 1, 2, 0),
            supports_synchronization2: false,
            ..capable()
        };
        assert_eq!(old.missing_requirements(), vec!["Vulkan 1.3", "synchronization2"]);
    }

    #[test]
    fn culling_needs_indirect_count() {
        let caps = GpuCapabilities {
            supports_draw_indirect_count: false,
            ..capable()
        };
        assert!(caps.meets_requirements());
        assert!(!caps.supports_gpu_culling());
        assert!(caps.summary().contains("indirect count: no"));
    }
}
