//! Per-structure build description.
//!
//! Usage:
//! - For each structure, add geometry with [`AccelBuildData::add_geometry`].
//! - Call [`AccelBuildData::finalize_geometry`] to get the size requirements.
//! - Size the scratch memory from those requirements (see [`crate::scratch`]).
//! - Create each structure from [`AccelBuildData::make_create_info`] and
//!   record its build, or hand the whole list to [`crate::BlasBuilder`].

use crate::allocator::AccelCreateInfo;
use crate::device::{AccelerationDevice, BuildSizes};
use crate::geometry::AccelGeometryInfo;
use ash::vk;

/// Mode, source, destination and scratch of the most recent build or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
}

impl BuildConfig {
    /// Full build into `dst`.
    pub fn build(dst: vk::AccelerationStructureKHR, scratch_address: vk::DeviceAddress) -> Self {
        Self {
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            src: vk::AccelerationStructureKHR::null(),
            dst,
            scratch_address,
        }
    }

    /// In-place refit of `accel`.
    pub const fn update(
        accel: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) -> Self {
        Self {
            mode: vk::BuildAccelerationStructureModeKHR::UPDATE,
            src: accel,
            dst: accel,
            scratch_address,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::build(vk::AccelerationStructureKHR::null(), 0)
    }
}

/// Geometry, flags and sizes of one acceleration structure.
#[derive(Clone, Default)]
pub struct AccelBuildData {
    /// Structure type, mandatory before finalizing.
    pub ty: Option<vk::AccelerationStructureTypeKHR>,
    /// Geometries of the structure.
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    /// Build range of each geometry, same length as `geometries`.
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Sizes reported by the last [`Self::finalize_geometry`].
    pub size_info: BuildSizes,
    pub build: BuildConfig,
}

impl AccelBuildData {
    pub fn new(ty: vk::AccelerationStructureTypeKHR) -> Self {
        Self {
            ty: Some(ty),
            ..Self::default()
        }
    }

    /// Empty bottom-level description.
    pub fn blas() -> Self {
        Self::new(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
    }

    /// Empty top-level description.
    pub fn tlas() -> Self {
        Self::new(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
    }

    /// Add a geometry with its build range.
    pub fn add_geometry(
        &mut self,
        geometry: vk::AccelerationStructureGeometryKHR<'static>,
        range: vk::AccelerationStructureBuildRangeInfoKHR,
    ) {
        self.geometries.push(geometry);
        self.ranges.push(range);
    }

    pub fn add_geometry_info(&mut self, info: AccelGeometryInfo) {
        self.add_geometry(info.geometry, info.range);
    }

    /// Instance geometry for a TLAS over `instance_count` instances.
    ///
    /// # Panics
    /// If this is not a top-level description.
    pub fn make_instance_geometry(
        &self,
        instance_count: u32,
        instance_buffer_address: vk::DeviceAddress,
    ) -> AccelGeometryInfo {
        assert_eq!(
            self.ty,
            Some(vk::AccelerationStructureTypeKHR::TOP_LEVEL),
            "instance geometry can only be used with a TLAS"
        );
        AccelGeometryInfo::instances(instance_buffer_address, instance_count)
    }

    /// Set the build flags and query the sizes needed to build.
    ///
    /// # Panics
    /// If no geometry was added or the type is unset.
    ///
    /// # Safety
    /// The geometry must reference valid device memory.
    pub unsafe fn finalize_geometry<D: AccelerationDevice>(
        &mut self,
        device: &D,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes {
        assert!(!self.geometries.is_empty(), "no geometry added to build data");
        assert!(self.ty.is_some(), "acceleration structure type not set");

        self.flags = flags;
        self.build = BuildConfig::default();

        let max_primitive_counts: Vec<u32> =
            self.ranges.iter().map(|range| range.primitive_count).collect();

        let build_info = self.build_geometry_info();
        let sizes = unsafe { device.build_sizes(&build_info, &max_primitive_counts) };
        self.size_info = sizes;
        sizes
    }

    /// Parameters to allocate a structure of the finalized size.
    ///
    /// # Panics
    /// If the type is unset or the sizes were never queried.
    pub fn make_create_info(&self) -> AccelCreateInfo {
        let ty = self.ty.expect("acceleration structure type not set");
        assert!(
            self.size_info.accel_size > 0,
            "acceleration structure size not set, call finalize_geometry first"
        );
        AccelCreateInfo {
            ty,
            size: self.size_info.accel_size,
        }
    }

    /// Whether the structure is built with `ALLOW_COMPACTION`.
    pub fn has_compact_flag(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    /// Build description for the current [`BuildConfig`], borrowing the geometry.
    pub fn build_geometry_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        let ty = self.ty.expect("acceleration structure type not set");
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(self.flags)
            .mode(self.build.mode)
            .src_acceleration_structure(self.build.src)
            .dst_acceleration_structure(self.build.dst)
            .geometries(&self.geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.build.scratch_address,
            })
    }

    /// Record a full build into `accel`.
    ///
    /// A barrier follows so a later build may reuse the same scratch memory.
    ///
    /// # Safety
    /// The command buffer must be recording and `scratch_address` must point to
    /// at least `size_info.build_scratch_size` bytes.
    pub unsafe fn cmd_build_acceleration_structure<D: AccelerationDevice>(
        &mut self,
        device: &D,
        cmd: vk::CommandBuffer,
        accel: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        self.build = BuildConfig::build(accel, scratch_address);
        unsafe { self.record(device, cmd) };
    }

    /// Record an in-place update of `accel`.
    ///
    /// # Safety
    /// As [`Self::cmd_build_acceleration_structure`]; `accel` must have been
    /// built with `ALLOW_UPDATE`.
    pub unsafe fn cmd_update_acceleration_structure<D: AccelerationDevice>(
        &mut self,
        device: &D,
        cmd: vk::CommandBuffer,
        accel: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        self.build = BuildConfig::update(accel, scratch_address);
        unsafe { self.record(device, cmd) };
    }

    unsafe fn record<D: AccelerationDevice>(&self, device: &D, cmd: vk::CommandBuffer) {
        assert_eq!(
            self.geometries.len(),
            self.ranges.len(),
            "geometry and range counts differ"
        );
        assert_ne!(
            self.build.dst,
            vk::AccelerationStructureKHR::null(),
            "acceleration structure not created"
        );

        let build_info = self.build_geometry_info();
        unsafe {
            device.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[self.ranges.as_slice()],
            );
            device.cmd_acceleration_structure_barrier(
                cmd,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            );
        }
    }
}

impl std::fmt::Debug for AccelBuildData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelBuildData")
            .field("ty", &self.ty)
            .field("geometry_count", &self.geometries.len())
            .field("flags", &self.flags)
            .field("size_info", &self.size_info)
            .field("build", &self.build)
            .finish()
    }
}
