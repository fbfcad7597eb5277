//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
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
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Acceleration structure limits of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// `VK_KHR_acceleration_structure` is exposed and the feature is enabled.
    pub supported: bool,
    /// Host-side query pool reset (`hostQueryReset`, core in 1.2).
    pub host_query_reset: bool,
    /// Required alignment of scratch buffer device addresses.
    pub min_scratch_offset_alignment: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
}

impl Default for RayTracingCapabilities {
    fn default() -> Self {
        Self {
            supported: false,
            host_query_reset: false,
            // Most common value reported by drivers.
            min_scratch_offset_alignment: 128,
            max_geometry_count: 0,
            max_instance_count: 0,
            max_primitive_count: 0,
        }
    }
}

/// Device extensions needed to build acceleration structures.
pub fn acceleration_structure_extensions() -> [&'static CStr; 2] {
    [
        ash::khr::acceleration_structure::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Acceleration structure support and limits
    pub ray_tracing: RayTracingCapabilities,

    // Available extensions
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

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 3;

        let has_extensions = acceleration_structure_extensions().iter().all(|ext| {
            ext.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        });

        let ray_tracing = if has_extensions {
            unsafe { query_ray_tracing(instance, physical_device) }
        } else {
            RayTracingCapabilities::default()
        };

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_synchronization2: has_vulkan_1_3,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),

            device_local_memory_mb,
            ray_tracing,

            available_extensions,
        }
    }

    /// Check if the GPU can build acceleration structures.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Scratch and instance buffers are passed by device address
        if !self.supports_buffer_device_address {
            return false;
        }

        self.ray_tracing.supported && self.ray_tracing.host_query_reset
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - AS scratch alignment {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.ray_tracing.min_scratch_offset_alignment,
        )
    }
}

/// Query acceleration structure features and properties.
///
/// # Safety
/// The instance and physical device must be valid and the device must expose
/// `VK_KHR_acceleration_structure`.
unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RayTracingCapabilities {
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut as_features)
        .push_next(&mut vulkan_1_2_features);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };

    RayTracingCapabilities {
        supported: as_features.acceleration_structure == vk::TRUE,
        host_query_reset: vulkan_1_2_features.host_query_reset == vk::TRUE,
        min_scratch_offset_alignment: as_properties
            .min_acceleration_structure_scratch_offset_alignment,
        max_geometry_count: as_properties.max_geometry_count,
        max_instance_count: as_properties.max_instance_count,
        max_primitive_count: as_properties.max_primitive_count,
    }
}
