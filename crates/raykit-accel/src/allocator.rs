//! Resource allocation for acceleration structures.

use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_gpu::{GpuAllocator, GpuBuffer, Result};

/// Parameters for allocating a new acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelCreateInfo {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub size: vk::DeviceSize,
}

/// An acceleration structure together with the buffer backing it.
///
/// The default value is the null structure.
#[derive(Debug, Default)]
pub struct AccelKhr {
    /// Vulkan acceleration structure handle.
    pub accel: vk::AccelerationStructureKHR,
    /// Backing storage buffer.
    pub buffer: GpuBuffer,
    /// Device address used to reference the structure from a TLAS.
    pub address: vk::DeviceAddress,
}

impl AccelKhr {
    pub fn is_null(&self) -> bool {
        self.accel == vk::AccelerationStructureKHR::null()
    }

    /// Size of the backing storage.
    pub const fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }
}

/// Allocator capabilities needed by the acceleration structure builders.
pub trait ResourceAllocator {
    /// Allocate backing storage and create a structure of `info.size` bytes.
    fn create_acceleration(&mut self, info: &AccelCreateInfo) -> Result<AccelKhr>;

    /// Destroy a structure and free its storage, leaving `accel` null.
    fn destroy_acceleration(&mut self, accel: &mut AccelKhr) -> Result<()>;

    /// Allocate a general purpose buffer (scratch, instances, geometry).
    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer>;

    fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()>;
}

/// [`ResourceAllocator`] over a [`GpuAllocator`].
pub struct VulkanAccelAllocator<'a> {
    allocator: &'a mut GpuAllocator,
    loader: &'a ash::khr::acceleration_structure::Device,
}

impl<'a> VulkanAccelAllocator<'a> {
    pub fn new(
        allocator: &'a mut GpuAllocator,
        loader: &'a ash::khr::acceleration_structure::Device,
    ) -> Self {
        Self { allocator, loader }
    }
}

impl ResourceAllocator for VulkanAccelAllocator<'_> {
    fn create_acceleration(&mut self, info: &AccelCreateInfo) -> Result<AccelKhr> {
        let name = if info.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            "tlas_buffer"
        } else {
            "blas_buffer"
        };

        let mut buffer = self.allocator.create_buffer(
            info.size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(info.size)
            .ty(info.ty);

        let accel = match unsafe { self.loader.create_acceleration_structure(&create_info, None) } {
            Ok(accel) => accel,
            Err(err) => {
                self.allocator.free_buffer(&mut buffer)?;
                return Err(err.into());
            }
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
        let address = unsafe {
            self.loader
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(AccelKhr {
            accel,
            buffer,
            address,
        })
    }

    fn destroy_acceleration(&mut self, accel: &mut AccelKhr) -> Result<()> {
        if !accel.is_null() {
            unsafe {
                self.loader
                    .destroy_acceleration_structure(accel.accel, None);
            }
        }
        self.allocator.free_buffer(&mut accel.buffer)?;
        *accel = AccelKhr::default();
        Ok(())
    }

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator.create_buffer(size, usage, location, name)
    }

    fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.free_buffer(buffer)
    }
}
