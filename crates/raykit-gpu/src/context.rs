//! GPU context management.

use crate::capabilities::{acceleration_structure_extensions, GpuCapabilities};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Headless GPU context with acceleration structure support.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) accel_loader: ash::khr::acceleration_structure::Device,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the `VK_KHR_acceleration_structure` function table.
    pub fn accel_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.accel_loader
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Queue used for acceleration structure builds (graphics or compute capable).
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Family index of [`Self::queue`].
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "raykit".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.ray_tracing.supported {
            return Err(GpuError::ExtensionNotSupported(
                "VK_KHR_acceleration_structure".to_string(),
            ));
        }
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_family = unsafe { find_queue_family(&instance, physical_device) }?;

        let (device, queue) = unsafe { create_device(&instance, physical_device, queue_family)? };

        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            accel_loader,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_family,
            queue,
        })
    }
}

/// Find a queue family able to record acceleration structure builds.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut compute_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = u32::try_from(i).map_err(|_| GpuError::NoSuitableDevice)?;

        // Prefer the universal queue, builds usually precede rendering
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            return Ok(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) && compute_family.is_none() {
            compute_family = Some(i);
        }
    }

    compute_family.ok_or(GpuError::NoSuitableDevice)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    acceleration_structure_extensions().to_vec()
}

/// Create the logical device and retrieve its queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    // Compacted-size query pools are reset from the host
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .host_query_reset(true)
        .scalar_block_layout(true);

    let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut as_features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };

    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok((device, queue))
}
