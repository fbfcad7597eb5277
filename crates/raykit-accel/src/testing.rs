//! In-memory device and allocator used by unit tests.

use crate::allocator::{AccelCreateInfo, AccelKhr, ResourceAllocator};
use crate::device::{AccelerationDevice, BuildSizes};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use raykit_gpu::{GpuBuffer, GpuError, Result};
use std::cell::RefCell;

/// A device call captured by [`MockDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    SizeQuery {
        ty: vk::AccelerationStructureTypeKHR,
        max_primitive_counts: Vec<u32>,
    },
    PoolCreated {
        query_count: u32,
    },
    PoolReset {
        first_query: u32,
        query_count: u32,
    },
    PoolDestroyed,
    Build {
        dst: Vec<vk::AccelerationStructureKHR>,
        scratch: Vec<vk::DeviceAddress>,
        update: Vec<bool>,
    },
    Barrier,
    QueryWrite {
        first_query: u32,
        structures: Vec<vk::AccelerationStructureKHR>,
    },
    SizeReadback {
        first_query: u32,
        query_count: u32,
    },
    Copy {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    },
}

/// Records every call and answers size queries deterministically.
#[derive(Default)]
pub struct MockDevice {
    log: RefCell<Vec<Recorded>>,
    /// Compacted size reported per query slot; missing slots report `None`.
    compacted: RefCell<Vec<Option<vk::DeviceSize>>>,
    next_pool: RefCell<u64>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes reported for a build over `primitive_count` primitives.
    pub const fn sizes_for(primitive_count: u32) -> BuildSizes {
        let n = primitive_count as u64;
        BuildSizes {
            accel_size: 1024 + 64 * n,
            build_scratch_size: 512 + 32 * n,
            update_scratch_size: 128 + 8 * n,
        }
    }

    pub fn handle(raw: u64) -> vk::AccelerationStructureKHR {
        vk::AccelerationStructureKHR::from_raw(raw)
    }

    /// Compacted size to report for each query slot.
    pub fn set_compacted_sizes(&self, sizes: Vec<Option<vk::DeviceSize>>) {
        *self.compacted.borrow_mut() = sizes;
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.borrow().clone()
    }

    /// Recorded build calls as lists of destination handles.
    pub fn build_batches(&self) -> Vec<Vec<vk::AccelerationStructureKHR>> {
        self.log
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Recorded::Build { dst, .. } => Some(dst.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }

    fn push(&self, call: Recorded) {
        self.log.borrow_mut().push(call);
    }
}

impl AccelerationDevice for MockDevice {
    unsafe fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        assert_eq!(build_info.geometry_count as usize, max_primitive_counts.len());
        self.push(Recorded::SizeQuery {
            ty: build_info.ty,
            max_primitive_counts: max_primitive_counts.to_vec(),
        });
        Self::sizes_for(max_primitive_counts.iter().sum())
    }

    unsafe fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool> {
        self.push(Recorded::PoolCreated { query_count });
        let mut next = self.next_pool.borrow_mut();
        *next += 1;
        Ok(vk::QueryPool::from_raw(*next))
    }

    unsafe fn reset_query_pool(&self, _pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.push(Recorded::PoolReset {
            first_query,
            query_count,
        });
    }

    unsafe fn destroy_query_pool(&self, _pool: vk::QueryPool) {
        self.push(Recorded::PoolDestroyed);
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        _cmd: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        assert_eq!(build_infos.len(), build_ranges.len());
        for (info, ranges) in build_infos.iter().zip(build_ranges) {
            assert_eq!(info.geometry_count as usize, ranges.len());
        }
        self.push(Recorded::Build {
            dst: build_infos
                .iter()
                .map(|info| info.dst_acceleration_structure)
                .collect(),
            scratch: build_infos
                .iter()
                .map(|info| unsafe { info.scratch_data.device_address })
                .collect(),
            update: build_infos
                .iter()
                .map(|info| info.mode == vk::BuildAccelerationStructureModeKHR::UPDATE)
                .collect(),
        });
    }

    unsafe fn cmd_acceleration_structure_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        _src_access: vk::AccessFlags2,
        _dst_access: vk::AccessFlags2,
    ) {
        self.push(Recorded::Barrier);
    }

    unsafe fn cmd_write_compacted_sizes(
        &self,
        _cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        _pool: vk::QueryPool,
        first_query: u32,
    ) {
        self.push(Recorded::QueryWrite {
            first_query,
            structures: structures.to_vec(),
        });
    }

    unsafe fn compacted_sizes(
        &self,
        _pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) -> Result<Vec<Option<vk::DeviceSize>>> {
        self.push(Recorded::SizeReadback {
            first_query,
            query_count,
        });
        let compacted = self.compacted.borrow();
        Ok((first_query..first_query + query_count)
            .map(|slot| compacted.get(slot as usize).copied().flatten())
            .collect())
    }

    unsafe fn cmd_copy_compact(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    ) {
        self.push(Recorded::Copy { src, dst });
    }
}

/// Hands out sequential handles and remembers what was destroyed.
#[derive(Debug, Default)]
pub struct MockAllocator {
    next_handle: u64,
    /// Creation requests in order.
    pub created: Vec<AccelCreateInfo>,
    /// Handles passed to `destroy_acceleration`, in order.
    pub destroyed: Vec<vk::AccelerationStructureKHR>,
    /// Fail every creation after this many successes.
    pub fail_after: Option<usize>,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device address given to the structure with `handle`.
    pub const fn address_of(handle: u64) -> vk::DeviceAddress {
        0x1_0000_0000 + handle * 0x1_0000
    }

    pub fn live_count(&self) -> usize {
        self.created.len() - self.destroyed.len()
    }
}

impl ResourceAllocator for MockAllocator {
    fn create_acceleration(&mut self, info: &AccelCreateInfo) -> Result<AccelKhr> {
        if self.fail_after.is_some_and(|limit| self.created.len() >= limit) {
            return Err(GpuError::AllocationFailed("mock allocator exhausted".into()));
        }
        self.next_handle += 1;
        self.created.push(*info);
        Ok(AccelKhr {
            accel: MockDevice::handle(self.next_handle),
            buffer: GpuBuffer {
                size: info.size,
                ..GpuBuffer::default()
            },
            address: Self::address_of(self.next_handle),
        })
    }

    fn destroy_acceleration(&mut self, accel: &mut AccelKhr) -> Result<()> {
        if !accel.is_null() {
            self.destroyed.push(accel.accel);
        }
        *accel = AccelKhr::default();
        Ok(())
    }

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _location: MemoryLocation,
        _name: &str,
    ) -> Result<GpuBuffer> {
        Ok(GpuBuffer {
            size,
            ..GpuBuffer::default()
        })
    }

    fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        *buffer = GpuBuffer::default();
        Ok(())
    }
}
