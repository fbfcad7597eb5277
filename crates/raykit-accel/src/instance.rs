//! Top-level instances referencing built BLAS.

use crate::geometry::to_transform_matrix;
use ash::vk;
use glam::Mat4;

/// Size of one instance record in the TLAS instance buffer.
pub const INSTANCE_STRIDE: vk::DeviceSize =
    std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize;

/// One placement of a BLAS in a TLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    /// Device address of the referenced BLAS.
    pub blas_address: vk::DeviceAddress,
    pub transform: Mat4,
    /// `gl_InstanceCustomIndexEXT`, 24 bits.
    pub custom_index: u32,
    /// Visibility mask tested against the ray cull mask.
    pub mask: u8,
    /// Hit group offset in the shader binding table, 24 bits.
    pub hit_group_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl TlasInstance {
    /// Visible to every ray, identity transform, no culling.
    pub fn new(blas_address: vk::DeviceAddress) -> Self {
        Self {
            blas_address,
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    #[must_use]
    pub const fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub const fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    /// Pack into the layout read by the device.
    ///
    /// # Panics
    /// In debug builds, if the custom index or hit group offset needs more than 24 bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_vk(&self) -> vk::AccelerationStructureInstanceKHR {
        debug_assert!(self.custom_index < 1 << 24, "custom index exceeds 24 bits");
        debug_assert!(self.hit_group_offset < 1 << 24, "hit group offset exceeds 24 bits");

        vk::AccelerationStructureInstanceKHR {
            transform: to_transform_matrix(self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.hit_group_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}
