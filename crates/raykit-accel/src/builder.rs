//! Batched bottom-level acceleration structure building with compaction.
//!
//! [`BlasBuilder`] walks a caller-owned list of [`AccelBuildData`], creating
//! and building structures in batches that respect a per-call memory budget
//! and the number of scratch regions available. Progress is kept in the
//! builder, so a large list can be spread over several command buffers:
//!
//! ```ignore
//! let mut builder = BlasBuilder::new(VulkanAccelDevice::from_context(&ctx));
//! loop {
//!     let done = execute_single_time_commands(device, &pool, queue, |cmd| unsafe {
//!         builder.cmd_create_parallel_blas(&mut alloc, cmd, &mut data, &mut blas, &scratch, hint)
//!     })?;
//!     execute_single_time_commands(device, &pool, queue, |cmd| unsafe {
//!         builder.cmd_compact_blas(&mut alloc, cmd, &mut data, &mut blas)
//!     })?;
//!     unsafe { builder.destroy_non_compacted_blas(&mut alloc)? };
//!     if done {
//!         break;
//!     }
//! }
//! ```

use std::ops::Range;

use crate::allocator::{AccelCreateInfo, AccelKhr, ResourceAllocator};
use crate::build_data::{AccelBuildData, BuildConfig};
use crate::device::AccelerationDevice;
use crate::stats::BlasStats;
use ash::vk;
use raykit_gpu::{GpuError, Result};
use tracing::{debug, info, warn};

/// Compacted-size query pool with one slot per structure in the build list.
#[derive(Debug, Clone, Copy)]
struct CompactionQueryPool {
    pool: vk::QueryPool,
    capacity: u32,
}

/// Builds BLAS in budgeted batches and compacts them afterwards.
pub struct BlasBuilder<D: AccelerationDevice> {
    device: D,
    query_pool: Option<CompactionQueryPool>,
    /// Next structure to build.
    current_blas_idx: usize,
    /// Next structure whose compacted size has not been read back.
    current_query_idx: usize,
    /// Pre-compaction structures waiting to be destroyed.
    cleanup_blas: Vec<AccelKhr>,
    stats: BlasStats,
}

impl<D: AccelerationDevice> BlasBuilder<D> {
    pub const fn new(device: D) -> Self {
        Self {
            device,
            query_pool: None,
            current_blas_idx: 0,
            current_query_idx: 0,
            cleanup_blas: Vec::new(),
            stats: BlasStats {
                total_original_size: 0,
                total_compact_size: 0,
            },
        }
    }

    pub const fn device(&self) -> &D {
        &self.device
    }

    pub const fn current_blas_idx(&self) -> usize {
        self.current_blas_idx
    }

    pub const fn current_query_idx(&self) -> usize {
        self.current_query_idx
    }

    pub const fn has_query_pool(&self) -> bool {
        self.query_pool.is_some()
    }

    /// Number of replaced structures waiting for [`Self::destroy_non_compacted_blas`].
    pub fn pending_cleanup_count(&self) -> usize {
        self.cleanup_blas.len()
    }

    /// Totals of every compaction done so far.
    pub const fn statistics(&self) -> BlasStats {
        self.stats
    }

    /// Create a compacted-size query pool for `max_blas_count` structures,
    /// replacing any previous pool.
    ///
    /// # Safety
    /// A previous pool must no longer be in use by the GPU.
    pub unsafe fn create_query_pool(&mut self, max_blas_count: u32) -> Result<()> {
        unsafe {
            self.destroy_query_pool();
            let pool = self.device.create_query_pool(max_blas_count)?;
            self.device.reset_query_pool(pool, 0, max_blas_count);
            self.query_pool = Some(CompactionQueryPool {
                pool,
                capacity: max_blas_count,
            });
        }
        debug!(max_blas_count, "Created compaction query pool");
        Ok(())
    }

    /// Build the next structures one at a time, all reusing `scratch_address`.
    ///
    /// Returns `true` once every structure in `build_data` has been built.
    ///
    /// # Safety
    /// As [`Self::cmd_create_parallel_blas`].
    pub unsafe fn cmd_create_blas<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        cmd: vk::CommandBuffer,
        build_data: &mut [AccelBuildData],
        blas_accel: &mut [AccelKhr],
        scratch_address: vk::DeviceAddress,
        hint_max_budget: vk::DeviceSize,
    ) -> Result<bool> {
        unsafe {
            self.cmd_create_parallel_blas(
                allocator,
                cmd,
                build_data,
                blas_accel,
                &[scratch_address],
                hint_max_budget,
            )
        }
    }

    /// Create and record builds for the next structures of `build_data` until
    /// `hint_max_budget` bytes of structure memory have been used by this call.
    ///
    /// Up to `scratch_addresses.len()` structures build in parallel per batch,
    /// structure `i` using `scratch_addresses[i % len]`. Created structures are
    /// stored in `blas_accel` at the index of their build data. Returns `true`
    /// once every structure has been built.
    ///
    /// Compacted sizes are only queried for structures built with
    /// `ALLOW_COMPACTION`, so flagged and unflagged structures may share a list.
    ///
    /// If creating a structure fails, the structures already created in the
    /// current batch are still recorded before the error is returned, and the
    /// next call resumes at the structure that failed.
    ///
    /// # Panics
    /// If `scratch_addresses` is empty or `blas_accel` is shorter than `build_data`.
    ///
    /// # Safety
    /// `cmd` must be recording, every scratch region must hold the build
    /// scratch of any structure assigned to it, and `build_data` must be the
    /// same list, in the same order, on every call until [`Self::destroy`].
    pub unsafe fn cmd_create_parallel_blas<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        cmd: vk::CommandBuffer,
        build_data: &mut [AccelBuildData],
        blas_accel: &mut [AccelKhr],
        scratch_addresses: &[vk::DeviceAddress],
        hint_max_budget: vk::DeviceSize,
    ) -> Result<bool> {
        assert!(!scratch_addresses.is_empty(), "no scratch address given");
        assert!(
            blas_accel.len() >= build_data.len(),
            "fewer acceleration structure slots than build data"
        );

        unsafe { self.initialize_query_pool_if_needed(build_data)? };

        let mut process_budget: vk::DeviceSize = 0;
        while self.current_blas_idx < build_data.len() && process_budget < hint_max_budget {
            let used = unsafe {
                self.build_acceleration_structures(
                    allocator,
                    cmd,
                    build_data,
                    blas_accel,
                    scratch_addresses,
                    hint_max_budget,
                    process_budget,
                )?
            };
            process_budget = process_budget.saturating_add(used);
        }

        Ok(self.current_blas_idx >= build_data.len())
    }

    unsafe fn initialize_query_pool_if_needed(
        &mut self,
        build_data: &[AccelBuildData],
    ) -> Result<()> {
        if self.query_pool.is_none() && build_data.iter().any(AccelBuildData::has_compact_flag) {
            let count = u32::try_from(build_data.len()).map_err(|_| {
                GpuError::InvalidState("too many structures for one query pool".to_string())
            })?;
            unsafe { self.create_query_pool(count)? };
        }
        Ok(())
    }

    /// One batch: create up to `scratch_addresses.len()` structures within the
    /// remaining budget, record a single build for all of them, then the
    /// compacted-size queries. Returns the structure memory used.
    #[allow(clippy::too_many_arguments)]
    unsafe fn build_acceleration_structures<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        cmd: vk::CommandBuffer,
        build_data: &mut [AccelBuildData],
        blas_accel: &mut [AccelKhr],
        scratch_addresses: &[vk::DeviceAddress],
        hint_max_budget: vk::DeviceSize,
        current_budget: vk::DeviceSize,
    ) -> Result<vk::DeviceSize> {
        let first = self.current_blas_idx;
        let mut budget_used: vk::DeviceSize = 0;
        let mut failure = None;

        while self.current_blas_idx - first < scratch_addresses.len()
            && current_budget.saturating_add(budget_used) < hint_max_budget
            && self.current_blas_idx < build_data.len()
        {
            let idx = self.current_blas_idx;
            let data = &mut build_data[idx];

            let accel = match allocator.create_acceleration(&data.make_create_info()) {
                Ok(accel) => accel,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let scratch_address = scratch_addresses[idx % scratch_addresses.len()];
            data.build = BuildConfig::build(accel.accel, scratch_address);
            blas_accel[idx] = accel;

            budget_used += data.size_info.accel_size;
            self.current_blas_idx += 1;
        }

        // Structures created before a failure still get built and queried
        let end = self.current_blas_idx;
        if end > first {
            unsafe {
                self.record_batch(cmd, &build_data[first..end], &blas_accel[first..end], first)?;
            }
            debug!(first, count = end - first, budget_used, "Recorded BLAS build batch");
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(budget_used),
        }
    }

    /// Record one build over `batch`, a barrier, and compacted-size queries for
    /// its flagged structures. `first` is the build index of `batch[0]`.
    unsafe fn record_batch(
        &self,
        cmd: vk::CommandBuffer,
        batch: &[AccelBuildData],
        accels: &[AccelKhr],
        first: usize,
    ) -> Result<()> {
        let build_infos: Vec<_> = batch.iter().map(AccelBuildData::build_geometry_info).collect();
        let build_ranges: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            batch.iter().map(|data| data.ranges.as_slice()).collect();

        unsafe {
            self.device
                .cmd_build_acceleration_structures(cmd, &build_infos, &build_ranges);
            // Scratch regions are reused by the next batch
            self.device.cmd_acceleration_structure_barrier(
                cmd,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            );
        }

        let Some(query_pool) = self.query_pool else {
            return Ok(());
        };
        if first + batch.len() > query_pool.capacity as usize {
            return Err(GpuError::InvalidState(format!(
                "query pool holds {} structures, batch ends at {}",
                query_pool.capacity,
                first + batch.len()
            )));
        }

        for run in compact_flag_runs(batch) {
            let structures: Vec<vk::AccelerationStructureKHR> =
                accels[run.clone()].iter().map(|blas| blas.accel).collect();
            let first_query = query_index(first + run.start)?;
            unsafe {
                self.device
                    .cmd_write_compacted_sizes(cmd, &structures, query_pool.pool, first_query);
            }
        }
        Ok(())
    }

    /// Replace every built structure that reported a compacted size with a
    /// compacted copy.
    ///
    /// Blocks until the compacted sizes of all flagged structures built since
    /// the last call are available. Replaced structures are kept until
    /// [`Self::destroy_non_compacted_blas`]. Does nothing without a query pool.
    ///
    /// If creating a compacted structure fails, the structures handled before
    /// it stay compacted and a later call resumes at the one that failed.
    ///
    /// # Safety
    /// `cmd` must be recording, and the command buffers holding the builds
    /// must have been submitted.
    pub unsafe fn cmd_compact_blas<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        cmd: vk::CommandBuffer,
        build_data: &mut [AccelBuildData],
        blas_accel: &mut [AccelKhr],
    ) -> Result<()> {
        let Some(query_pool) = self.query_pool else {
            return Ok(());
        };
        let pending = self.current_query_idx..self.current_blas_idx;
        if pending.is_empty() {
            return Ok(());
        }

        // Unflagged structures never had their slot written
        let mut compact_sizes = vec![None; pending.len()];
        for run in compact_flag_runs(&build_data[pending.clone()]) {
            let count = query_index(run.len())?;
            let sizes = unsafe {
                self.device.compacted_sizes(
                    query_pool.pool,
                    query_index(pending.start + run.start)?,
                    count,
                )?
            };
            compact_sizes[run].copy_from_slice(&sizes);
        }

        let mut compacted = 0usize;
        for (i, compact_size) in pending.clone().zip(compact_sizes) {
            if let Some(compact_size) = compact_size {
                let data = &mut build_data[i];
                let new_accel = allocator.create_acceleration(&AccelCreateInfo {
                    ty: data.ty.unwrap_or(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL),
                    size: compact_size,
                })?;

                self.stats.record(data.size_info.accel_size, compact_size);
                data.size_info.accel_size = compact_size;

                unsafe {
                    self.device
                        .cmd_copy_compact(cmd, data.build.dst, new_accel.accel);
                }
                data.build.dst = new_accel.accel;

                let old = std::mem::replace(&mut blas_accel[i], new_accel);
                self.cleanup_blas.push(old);
                compacted += 1;
            }
            self.current_query_idx = i + 1;
        }

        info!(compacted, queried = pending.len(), "{}", self.stats);
        Ok(())
    }

    /// Destroy the structures replaced by compaction.
    ///
    /// # Safety
    /// The compacting copies must have completed on the GPU.
    pub unsafe fn destroy_non_compacted_blas<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
    ) -> Result<()> {
        while let Some(mut blas) = self.cleanup_blas.pop() {
            allocator.destroy_acceleration(&mut blas)?;
        }
        Ok(())
    }

    /// Release the query pool and pending cleanup, and rewind to the start of
    /// a new build list. Statistics are kept.
    ///
    /// # Safety
    /// No submitted work may still use the pool or the replaced structures.
    pub unsafe fn destroy<A: ResourceAllocator>(&mut self, allocator: &mut A) -> Result<()> {
        unsafe {
            self.destroy_query_pool();
            self.destroy_non_compacted_blas(allocator)?;
        }
        self.current_blas_idx = 0;
        self.current_query_idx = 0;
        Ok(())
    }

    unsafe fn destroy_query_pool(&mut self) {
        if let Some(query_pool) = self.query_pool.take() {
            unsafe { self.device.destroy_query_pool(query_pool.pool) };
        }
    }
}

impl<D: AccelerationDevice> Drop for BlasBuilder<D> {
    fn drop(&mut self) {
        unsafe { self.destroy_query_pool() };
        if !self.cleanup_blas.is_empty() {
            warn!(
                count = self.cleanup_blas.len(),
                "BlasBuilder dropped with non-compacted structures still alive"
            );
        }
    }
}

/// Contiguous ranges of `build_data` built with `ALLOW_COMPACTION`.
fn compact_flag_runs(build_data: &[AccelBuildData]) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for (i, data) in build_data.iter().enumerate() {
        if !data.has_compact_flag() {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == i => run.end += 1,
            _ => runs.push(i..i + 1),
        }
    }
    runs
}

fn query_index(index: usize) -> Result<u32> {
    u32::try_from(index)
        .map_err(|_| GpuError::InvalidState("compaction query index exceeds u32".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::AccelGeometryInfo;
    use crate::testing::{MockAllocator, MockDevice, Recorded};
    use ash::vk::Handle;

    type Flags = vk::BuildAccelerationStructureFlagsKHR;

    const CMD: vk::CommandBuffer = vk::CommandBuffer::null();

    /// Builder, allocator and a finalized build list sharing one mock device.
    struct Fixture {
        builder: BlasBuilder<MockDevice>,
        alloc: MockAllocator,
        data: Vec<AccelBuildData>,
        blas: Vec<AccelKhr>,
    }

    impl Fixture {
        fn new(primitive_counts: &[u32], flags: Flags) -> Self {
            let flags: Vec<Flags> = primitive_counts.iter().map(|_| flags).collect();
            Self::with_primitives(primitive_counts, &flags)
        }

        /// One single-primitive structure per entry of `flags`.
        fn with_flags(flags: &[Flags]) -> Self {
            Self::with_primitives(&vec![1; flags.len()], flags)
        }

        fn with_primitives(primitive_counts: &[u32], flags: &[Flags]) -> Self {
            let device = MockDevice::new();
            let data = primitive_counts
                .iter()
                .zip(flags)
                .map(|(&count, &flags)| {
                    let mut data = AccelBuildData::blas();
                    data.add_geometry_info(AccelGeometryInfo::aabbs(0x1000, count));
                    unsafe { data.finalize_geometry(&device, flags) };
                    data
                })
                .collect::<Vec<_>>();
            device.clear();

            Self {
                builder: BlasBuilder::new(device),
                alloc: MockAllocator::new(),
                blas: std::iter::repeat_with(AccelKhr::default)
                    .take(data.len())
                    .collect(),
                data,
            }
        }

        fn device(&self) -> &MockDevice {
            self.builder.device()
        }

        fn build(&mut self, scratch: &[vk::DeviceAddress], budget: vk::DeviceSize) -> Result<bool> {
            unsafe {
                self.builder.cmd_create_parallel_blas(
                    &mut self.alloc,
                    CMD,
                    &mut self.data,
                    &mut self.blas,
                    scratch,
                    budget,
                )
            }
        }

        fn build_serial(
            &mut self,
            scratch: vk::DeviceAddress,
            budget: vk::DeviceSize,
        ) -> Result<bool> {
            unsafe {
                self.builder.cmd_create_blas(
                    &mut self.alloc,
                    CMD,
                    &mut self.data,
                    &mut self.blas,
                    scratch,
                    budget,
                )
            }
        }

        fn compact(&mut self) -> Result<()> {
            unsafe {
                self.builder
                    .cmd_compact_blas(&mut self.alloc, CMD, &mut self.data, &mut self.blas)
            }
        }

        fn cleanup(&mut self) -> Result<()> {
            unsafe { self.builder.destroy_non_compacted_blas(&mut self.alloc) }
        }

        /// Destination handles of every recorded build, in order.
        fn built(&self) -> Vec<vk::AccelerationStructureKHR> {
            self.device().build_batches().concat()
        }

        fn query_writes(&self) -> Vec<(u32, usize)> {
            self.device()
                .recorded()
                .into_iter()
                .filter_map(|call| match call {
                    Recorded::QueryWrite {
                        first_query,
                        structures,
                    } => Some((first_query, structures.len())),
                    _ => None,
                })
                .collect()
        }
    }

    fn h(raw: u64) -> vk::AccelerationStructureKHR {
        MockDevice::handle(raw)
    }

    #[test]
    fn unlimited_budget_builds_everything_in_one_call() {
        let mut fx = Fixture::new(&[1; 10], Flags::PREFER_FAST_TRACE);

        assert!(fx.build(&[0x1000, 0x2000], 1_000_000).unwrap());

        assert_eq!(fx.builder.current_blas_idx(), 10);
        let batches = fx.device().build_batches();
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|batch| batch.len() == 2));
        assert!(fx.blas.iter().all(|b| !b.is_null()));
        assert!(!fx.builder.has_query_pool());
    }

    #[test]
    fn scratch_slots_are_assigned_round_robin() {
        let mut fx = Fixture::new(&[1; 5], Flags::empty());
        let scratch = [0xa000, 0xb000];

        fx.build(&scratch, u64::MAX).unwrap();

        let scratch_used: Vec<_> = fx
            .device()
            .recorded()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Build { scratch, .. } => Some(scratch),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(scratch_used, vec![0xa000, 0xb000, 0xa000, 0xb000, 0xa000]);
        for (i, d) in fx.data.iter().enumerate() {
            assert_eq!(d.build.dst, fx.blas[i].accel);
            assert_eq!(d.build.scratch_address, scratch[i % 2]);
        }
    }

    #[test]
    fn budget_limits_each_call_and_resumes() {
        let mut fx = Fixture::new(&[1; 7], Flags::empty());
        let accel_size = MockDevice::sizes_for(1).accel_size;

        // Two structures fit before the budget is reached
        let budget = accel_size + 1;
        let mut calls = 0;
        let mut previous = 0;
        loop {
            let done = fx.build(&[0x1000; 4], budget).unwrap();
            calls += 1;
            assert!(fx.builder.current_blas_idx() > previous);
            assert!(fx.builder.current_blas_idx() - previous <= 2);
            previous = fx.builder.current_blas_idx();
            if done {
                break;
            }
        }

        assert_eq!(calls, 4);
        assert_eq!(fx.builder.current_blas_idx(), 7);
        assert_eq!(fx.alloc.created.len(), 7);

        assert!(fx.build(&[0x1000; 4], budget).unwrap());
        assert_eq!(fx.alloc.created.len(), 7);
    }

    #[test]
    fn zero_budget_makes_no_progress() {
        let mut fx = Fixture::new(&[1; 3], Flags::empty());

        assert!(!fx.build(&[0x1000], 0).unwrap());
        assert_eq!(fx.builder.current_blas_idx(), 0);
        assert!(fx.alloc.created.is_empty());
    }

    #[test]
    fn serial_build_records_one_structure_per_build() {
        let mut fx = Fixture::new(&[3, 1, 2], Flags::empty());

        assert!(fx.build_serial(0x4000, u64::MAX).unwrap());

        let batches = fx.device().build_batches();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch.len() == 1));
        assert!(fx.data.iter().all(|d| d.build.scratch_address == 0x4000));
    }

    #[test]
    fn each_build_is_followed_by_barrier_then_queries() {
        let mut fx = Fixture::new(&[1; 3], Flags::ALLOW_COMPACTION);

        fx.build(&[0x1000, 0x2000], u64::MAX).unwrap();

        assert_eq!(
            fx.device().recorded(),
            vec![
                Recorded::PoolCreated { query_count: 3 },
                Recorded::PoolReset {
                    first_query: 0,
                    query_count: 3,
                },
                Recorded::Build {
                    dst: vec![h(1), h(2)],
                    scratch: vec![0x1000, 0x2000],
                    update: vec![false, false],
                },
                Recorded::Barrier,
                Recorded::QueryWrite {
                    first_query: 0,
                    structures: vec![h(1), h(2)],
                },
                Recorded::Build {
                    dst: vec![h(3)],
                    scratch: vec![0x1000],
                    update: vec![false],
                },
                Recorded::Barrier,
                Recorded::QueryWrite {
                    first_query: 2,
                    structures: vec![h(3)],
                },
            ]
        );
    }

    #[test]
    fn query_slots_follow_build_order_across_calls() {
        let mut fx = Fixture::new(&[1; 4], Flags::ALLOW_COMPACTION);
        let budget = MockDevice::sizes_for(1).accel_size;

        while !fx.build(&[0x1000; 2], budget).unwrap() {}

        assert_eq!(fx.query_writes(), vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        let created = fx
            .device()
            .recorded()
            .iter()
            .filter(|call| matches!(call, Recorded::PoolCreated { .. }))
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn queries_skip_structures_without_compaction_flag() {
        let mut fx = Fixture::with_flags(&[
            Flags::ALLOW_COMPACTION,
            Flags::PREFER_FAST_TRACE,
            Flags::ALLOW_COMPACTION,
            Flags::ALLOW_COMPACTION,
        ]);
        fx.device().set_compacted_sizes(vec![Some(100); 4]);

        fx.build(&[0x1000; 4], u64::MAX).unwrap();
        assert_eq!(fx.query_writes(), vec![(0, 1), (2, 2)]);

        fx.device().clear();
        fx.compact().unwrap();

        let readbacks: Vec<_> = fx
            .device()
            .recorded()
            .into_iter()
            .filter(|call| matches!(call, Recorded::SizeReadback { .. }))
            .collect();
        assert_eq!(
            readbacks,
            vec![
                Recorded::SizeReadback {
                    first_query: 0,
                    query_count: 1,
                },
                Recorded::SizeReadback {
                    first_query: 2,
                    query_count: 2,
                },
            ]
        );
        assert_eq!(fx.blas[1].accel, h(2));
        assert_eq!(fx.builder.pending_cleanup_count(), 3);
        assert_eq!(fx.builder.current_query_idx(), 4);
    }

    #[test]
    fn compact_flag_runs_group_neighbours() {
        let fx = Fixture::with_flags(&[
            Flags::PREFER_FAST_TRACE,
            Flags::ALLOW_COMPACTION,
            Flags::ALLOW_COMPACTION,
            Flags::empty(),
            Flags::ALLOW_COMPACTION,
        ]);
        assert_eq!(compact_flag_runs(&fx.data), vec![1..3, 4..5]);
        assert!(compact_flag_runs(&[]).is_empty());
    }

    #[test]
    fn compaction_replaces_flagged_structures() {
        let mut fx = Fixture::new(&[1; 3], Flags::ALLOW_COMPACTION);
        fx.data[0].size_info.accel_size = 1000;
        fx.data[1].size_info.accel_size = 2000;

        fx.build(&[0x1000; 3], u64::MAX).unwrap();
        let third_before = fx.blas[2].accel;
        let third_size = fx.data[2].size_info.accel_size;
        fx.device().set_compacted_sizes(vec![Some(600), Some(1500), None]);
        fx.device().clear();

        fx.compact().unwrap();

        let stats = fx.builder.statistics();
        assert_eq!(stats.total_original_size, 3000);
        assert_eq!(stats.total_compact_size, 2100);

        assert_eq!(fx.alloc.created.len(), 5);
        assert_eq!(fx.alloc.created[3].size, 600);
        assert_eq!(fx.alloc.created[4].size, 1500);
        assert_eq!(fx.blas[0].size(), 600);
        assert_eq!(fx.blas[1].size(), 1500);
        assert_eq!(fx.data[0].size_info.accel_size, 600);
        assert_eq!(fx.data[0].build.dst, fx.blas[0].accel);
        assert_eq!(fx.blas[2].accel, third_before);
        assert_eq!(fx.data[2].size_info.accel_size, third_size);
        assert_eq!(fx.builder.pending_cleanup_count(), 2);
        assert_eq!(fx.builder.current_query_idx(), 3);

        assert_eq!(
            fx.device().recorded(),
            vec![
                Recorded::SizeReadback {
                    first_query: 0,
                    query_count: 3,
                },
                Recorded::Copy {
                    src: h(1),
                    dst: h(4),
                },
                Recorded::Copy {
                    src: h(2),
                    dst: h(5),
                },
            ]
        );

        fx.cleanup().unwrap();
        assert_eq!(fx.builder.pending_cleanup_count(), 0);
        let mut destroyed = fx.alloc.destroyed.clone();
        destroyed.sort_by_key(|handle| handle.as_raw());
        assert_eq!(destroyed, vec![h(1), h(2)]);
        assert_eq!(fx.alloc.live_count(), 3);
    }

    #[test]
    fn compaction_only_reads_new_queries() {
        let mut fx = Fixture::new(&[1; 4], Flags::ALLOW_COMPACTION);
        let budget = 2 * MockDevice::sizes_for(1).accel_size;
        fx.device().set_compacted_sizes(vec![Some(100); 4]);

        assert!(!fx.build(&[0x1000; 4], budget).unwrap());
        fx.compact().unwrap();
        assert_eq!(fx.builder.current_query_idx(), 2);

        fx.device().clear();
        assert!(fx.build(&[0x1000; 4], budget).unwrap());
        fx.compact().unwrap();

        assert!(fx.device().recorded().contains(&Recorded::SizeReadback {
            first_query: 2,
            query_count: 2,
        }));
        assert_eq!(fx.builder.current_query_idx(), 4);
        assert_eq!(fx.builder.pending_cleanup_count(), 4);
        assert_eq!(fx.builder.statistics().total_compact_size, 400);
    }

    #[test]
    fn compaction_without_pool_is_noop() {
        let mut fx = Fixture::new(&[1; 2], Flags::PREFER_FAST_TRACE);

        fx.build(&[0x1000], u64::MAX).unwrap();
        fx.device().clear();
        fx.compact().unwrap();

        assert!(fx.device().recorded().is_empty());
        assert_eq!(fx.builder.statistics(), BlasStats::default());
        assert_eq!(fx.builder.current_query_idx(), 0);
    }

    #[test]
    fn compaction_with_nothing_pending_is_noop() {
        let mut fx = Fixture::new(&[], Flags::empty());
        unsafe { fx.builder.create_query_pool(4).unwrap() };
        fx.device().clear();

        fx.compact().unwrap();
        assert!(fx.device().recorded().is_empty());
    }

    #[test]
    fn failed_allocation_still_records_created_structures() {
        let mut fx = Fixture::new(&[1; 3], Flags::ALLOW_COMPACTION);
        fx.alloc.fail_after = Some(1);

        let result = fx.build(&[0x1000; 3], u64::MAX);
        assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
        assert_eq!(fx.builder.current_blas_idx(), 1);
        assert_eq!(fx.built(), vec![h(1)]);
        assert_eq!(fx.query_writes(), vec![(0, 1)]);

        fx.alloc.fail_after = None;
        assert!(fx.build(&[0x1000; 3], u64::MAX).unwrap());

        // Every structure below the cursor has exactly one recorded build
        let built = fx.built();
        assert_eq!(built, vec![h(1), h(2), h(3)]);
        for blas in &fx.blas {
            assert_eq!(built.iter().filter(|&&b| b == blas.accel).count(), 1);
        }
        assert_eq!(fx.query_writes(), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn failed_compaction_resumes_without_compacting_twice() {
        let mut fx = Fixture::new(&[1; 3], Flags::ALLOW_COMPACTION);
        let original = MockDevice::sizes_for(1).accel_size;
        fx.device().set_compacted_sizes(vec![Some(100); 3]);
        fx.build(&[0x1000; 3], u64::MAX).unwrap();

        fx.alloc.fail_after = Some(fx.alloc.created.len() + 1);
        let result = fx.compact();
        assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
        assert_eq!(fx.builder.current_query_idx(), 1);
        assert_eq!(fx.builder.pending_cleanup_count(), 1);
        let compacted_first = fx.blas[0].accel;

        fx.alloc.fail_after = None;
        fx.compact().unwrap();

        let stats = fx.builder.statistics();
        assert_eq!(stats.total_original_size, 3 * original);
        assert_eq!(stats.total_compact_size, 300);
        assert_eq!(fx.builder.pending_cleanup_count(), 3);
        assert_eq!(fx.builder.current_query_idx(), 3);
        assert_eq!(fx.blas[0].accel, compacted_first);

        fx.cleanup().unwrap();
        let mut destroyed = fx.alloc.destroyed.clone();
        destroyed.sort_by_key(|handle| handle.as_raw());
        assert_eq!(destroyed, vec![h(1), h(2), h(3)]);
        assert!(fx.blas.iter().all(|b| b.size() == 100));
    }

    #[test]
    fn undersized_query_pool_is_an_error() {
        let mut fx = Fixture::new(&[1; 2], Flags::ALLOW_COMPACTION);
        unsafe { fx.builder.create_query_pool(1).unwrap() };

        let result = fx.build(&[0x1000; 2], u64::MAX);
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn destroy_rewinds_and_releases() {
        let mut fx = Fixture::new(&[1; 2], Flags::ALLOW_COMPACTION);
        fx.device().set_compacted_sizes(vec![Some(64); 2]);

        fx.build(&[0x1000], u64::MAX).unwrap();
        fx.compact().unwrap();
        unsafe { fx.builder.destroy(&mut fx.alloc).unwrap() };

        assert!(!fx.builder.has_query_pool());
        assert_eq!(fx.builder.pending_cleanup_count(), 0);
        assert_eq!(fx.builder.current_blas_idx(), 0);
        assert_eq!(fx.builder.current_query_idx(), 0);
        assert_eq!(fx.builder.statistics().total_compact_size, 128);
        assert!(fx.device().recorded().contains(&Recorded::PoolDestroyed));
    }

    #[test]
    fn recreating_pool_destroys_old_one() {
        let mut fx = Fixture::new(&[], Flags::empty());
        unsafe {
            fx.builder.create_query_pool(2).unwrap();
            fx.builder.create_query_pool(8).unwrap();
        }
        let recorded = fx.device().recorded();
        assert_eq!(recorded[2], Recorded::PoolDestroyed);
        assert_eq!(recorded[3], Recorded::PoolCreated { query_count: 8 });
    }
}
