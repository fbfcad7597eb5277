//! Device seam for acceleration structure work.
//!
//! Everything the builder asks of the GPU goes through [`AccelerationDevice`]:
//! size queries, the compacted-size query pool, and command recording.
//! [`VulkanAccelDevice`] is the real implementation on top of `ash`.

use ash::vk;
use raykit_gpu::{GpuContext, Result};

/// Memory requirements reported for one acceleration structure build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    /// Size of the acceleration structure itself.
    pub accel_size: vk::DeviceSize,
    /// Scratch needed for a full build.
    pub build_scratch_size: vk::DeviceSize,
    /// Scratch needed for an in-place update.
    pub update_scratch_size: vk::DeviceSize,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for BuildSizes {
    fn from(sizes: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            accel_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }
}

/// GPU operations needed to build and compact acceleration structures.
///
/// Command methods only record into `cmd`; nothing here waits on the GPU
/// except [`AccelerationDevice::compacted_sizes`].
pub trait AccelerationDevice {
    /// Query structure and scratch sizes for a build.
    ///
    /// # Safety
    /// `build_info` must describe valid geometry for this device.
    unsafe fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes;

    /// Create a pool of `query_count` compacted-size queries.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool>;

    /// Reset a range of queries from the host.
    ///
    /// # Safety
    /// The pool must not be in use by the GPU.
    unsafe fn reset_query_pool(&self, pool: vk::QueryPool, first_query: u32, query_count: u32);

    /// # Safety
    /// The pool must not be in use by the GPU.
    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Record one build call covering every entry of `build_infos`.
    ///
    /// # Safety
    /// The command buffer must be recording; all handles and addresses in
    /// `build_infos` must be valid.
    unsafe fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    /// Record a memory barrier between acceleration structure build stages.
    ///
    /// # Safety
    /// The command buffer must be recording.
    unsafe fn cmd_acceleration_structure_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
    );

    /// Record compacted-size queries for `structures` starting at `first_query`.
    ///
    /// # Safety
    /// The command buffer must be recording and the structures built earlier
    /// in submission order.
    unsafe fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first_query: u32,
    );

    /// Read back compacted sizes, blocking until every result is available.
    ///
    /// `None` marks a structure that was not built with compaction allowed.
    ///
    /// # Safety
    /// Every query in the range must have been written by submitted work.
    unsafe fn compacted_sizes(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) -> Result<Vec<Option<vk::DeviceSize>>>;

    /// Record a compacting copy from `src` into `dst`.
    ///
    /// # Safety
    /// The command buffer must be recording and `src` fully built.
    unsafe fn cmd_copy_compact(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    );
}

/// [`AccelerationDevice`] backed by a Vulkan device.
#[derive(Clone)]
pub struct VulkanAccelDevice {
    device: ash::Device,
    loader: ash::khr::acceleration_structure::Device,
}

impl VulkanAccelDevice {
    /// Wrap a device and its acceleration structure function table.
    pub const fn new(
        device: ash::Device,
        loader: ash::khr::acceleration_structure::Device,
    ) -> Self {
        Self { device, loader }
    }

    /// Borrow the handles of a [`GpuContext`].
    pub fn from_context(ctx: &GpuContext) -> Self {
        Self::new(ctx.device().clone(), ctx.accel_loader().clone())
    }

    pub const fn loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.loader
    }
}

impl AccelerationDevice for VulkanAccelDevice {
    unsafe fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                max_primitive_counts,
                &mut sizes,
            );
        }
        sizes.into()
    }

    unsafe fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(query_count);
        let pool = unsafe { self.device.create_query_pool(&create_info, None)? };
        Ok(pool)
    }

    unsafe fn reset_query_pool(&self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        unsafe { self.device.reset_query_pool(pool, first_query, query_count) };
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        unsafe {
            self.loader
                .cmd_build_acceleration_structures(cmd, build_infos, build_ranges);
        }
    }

    unsafe fn cmd_acceleration_structure_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(src_access)
            .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .dst_access_mask(dst_access);

        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));

        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    unsafe fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first_query: u32,
    ) {
        unsafe {
            self.loader.cmd_write_acceleration_structures_properties(
                cmd,
                structures,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                first_query,
            );
        }
    }

    unsafe fn compacted_sizes(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) -> Result<Vec<Option<vk::DeviceSize>>> {
        let mut sizes = vec![0u64; query_count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                first_query,
                &mut sizes,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )?;
        }
        // Unflagged structures report zero
        Ok(sizes.into_iter().map(|size| (size > 0).then_some(size)).collect())
    }

    unsafe fn cmd_copy_compact(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    ) {
        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe { self.loader.cmd_copy_acceleration_structure(cmd, &copy_info) };
    }
}
