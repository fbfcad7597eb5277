//! Geometry inputs for acceleration structure builds.

use ash::vk;
use glam::Mat4;

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    pub const STRIDE: vk::DeviceSize = std::mem::size_of::<Self>() as vk::DeviceSize;

    /// Axis-aligned box spanning `min..max`.
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            min_x: min[0],
            min_y: min[1],
            min_z: min[2],
            max_x: max[0],
            max_y: max[1],
            max_z: max[2],
        }
    }

    /// Unit-sized cube scaled to `size`, anchored at the origin.
    pub const fn cube(size: f32) -> Self {
        Self::new([0.0; 3], [size; 3])
    }
}

/// One geometry together with its build range.
#[derive(Clone, Copy)]
pub struct AccelGeometryInfo {
    pub geometry: vk::AccelerationStructureGeometryKHR<'static>,
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

impl AccelGeometryInfo {
    /// Opaque procedural geometry made of `count` tightly packed [`AabbPositions`].
    pub fn aabbs(aabb_address: vk::DeviceAddress, count: u32) -> Self {
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: aabb_address,
                    })
                    .stride(AabbPositions::STRIDE),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count);

        Self { geometry, range }
    }

    /// Instance geometry reading `count` instances from `instance_address`.
    pub fn instances(instance_address: vk::DeviceAddress, count: u32) -> Self {
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_address,
                    }),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count);

        Self { geometry, range }
    }
}

impl std::fmt::Debug for AccelGeometryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelGeometryInfo")
            .field("geometry_type", &self.geometry.geometry_type)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Convert a column-major [`Mat4`] to the row-major 3x4 layout used by instances.
pub fn to_transform_matrix(matrix: Mat4) -> vk::TransformMatrixKHR {
    let rows = matrix.transpose().to_cols_array();
    let mut out = [0.0f32; 12];
    out.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix: out }
}
