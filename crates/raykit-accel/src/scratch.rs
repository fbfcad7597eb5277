//! Scratch buffer sizing strategy for parallel builds.
//!
//! Strategy:
//! - Align every build scratch requirement and sum them.
//! - If the sum is within the budget, every structure gets its own region
//!   and all of them can build at once.
//! - Otherwise, allocate `n * max_scratch` where `n` is how many of the
//!   largest regions fit the budget (at least one, at most one per
//!   structure). The `n` regions are reused round-robin.
//!
//! Usage:
//! - Call [`scratch_size`] and allocate a scratch buffer of that size.
//! - Call [`scratch_addresses`] with the buffer address and pass the result
//!   to [`crate::BlasBuilder::cmd_create_parallel_blas`].

use crate::build_data::AccelBuildData;
use ash::vk;

/// Scratch offset alignment used when the device reports none.
pub const DEFAULT_SCRATCH_ALIGNMENT: u32 = 128;

/// The device's `minAccelerationStructureScratchOffsetAlignment`, or
/// [`DEFAULT_SCRATCH_ALIGNMENT`] if it is zero.
pub const fn scratch_alignment(device_alignment: u32) -> u32 {
    if device_alignment == 0 {
        DEFAULT_SCRATCH_ALIGNMENT
    } else {
        device_alignment
    }
}

/// Largest and total aligned build scratch size of a build list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchSizeInfo {
    pub max_scratch: vk::DeviceSize,
    pub total_scratch: vk::DeviceSize,
}

/// Round `value` up to a multiple of `alignment`.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.next_multiple_of(alignment)
    }
}

pub fn aligned_scratch_sizes(build_data: &[AccelBuildData], min_alignment: u32) -> ScratchSizeInfo {
    build_data
        .iter()
        .map(|data| align_up(data.size_info.build_scratch_size, u64::from(min_alignment)))
        .fold(ScratchSizeInfo::default(), |acc, aligned| ScratchSizeInfo {
            max_scratch: acc.max_scratch.max(aligned),
            total_scratch: acc.total_scratch + aligned,
        })
}

/// Number of `max_scratch` regions that fit `hint_max_budget`, clamped to `[1, count]`.
fn scratch_slot_count(
    hint_max_budget: vk::DeviceSize,
    max_scratch: vk::DeviceSize,
    count: usize,
) -> u64 {
    if count == 0 {
        return 0;
    }
    hint_max_budget
        .checked_div(max_scratch)
        .unwrap_or(1)
        .clamp(1, count as u64)
}

/// Scratch buffer size to allocate for building `build_data` under `hint_max_budget`.
pub fn scratch_size(
    hint_max_budget: vk::DeviceSize,
    build_data: &[AccelBuildData],
    min_alignment: u32,
) -> vk::DeviceSize {
    let ScratchSizeInfo {
        max_scratch,
        total_scratch,
    } = aligned_scratch_sizes(build_data, min_alignment);

    if total_scratch < hint_max_budget {
        total_scratch
    } else {
        scratch_slot_count(hint_max_budget, max_scratch, build_data.len()) * max_scratch
    }
}

/// Scratch addresses inside a buffer of [`scratch_size`] bytes at `scratch_buffer_address`.
///
/// Returns one address per structure when everything fits the budget,
/// otherwise one address per reusable slot.
pub fn scratch_addresses(
    hint_max_budget: vk::DeviceSize,
    build_data: &[AccelBuildData],
    scratch_buffer_address: vk::DeviceAddress,
    min_alignment: u32,
) -> Vec<vk::DeviceAddress> {
    let ScratchSizeInfo {
        max_scratch,
        total_scratch,
    } = aligned_scratch_sizes(build_data, min_alignment);

    if total_scratch < hint_max_budget {
        build_data
            .iter()
            .scan(scratch_buffer_address, |address, data| {
                let current = *address;
                *address += align_up(data.size_info.build_scratch_size, u64::from(min_alignment));
                Some(current)
            })
            .collect()
    } else {
        let count = scratch_slot_count(hint_max_budget, max_scratch, build_data.len());
        (0..count)
            .map(|slot| scratch_buffer_address + slot * max_scratch)
            .collect()
    }
}
