//! Acceleration structure building for raykit.
//!
//! This crate provides:
//! - Per-structure build descriptions and size queries ([`AccelBuildData`])
//! - Scratch memory planning under a memory budget ([`scratch`])
//! - Budgeted, resumable batch building of BLAS with compaction ([`BlasBuilder`])
//! - Compaction statistics ([`BlasStats`])
//! - TLAS instance packing ([`TlasInstance`])
//!
//! GPU access goes through the [`AccelerationDevice`] and
//! [`ResourceAllocator`] traits; [`VulkanAccelDevice`] and
//! [`VulkanAccelAllocator`] implement them on top of `raykit-gpu`.
//!
//! # Example
//!
//! ```ignore
//! use raykit_accel::{scratch, AccelBuildData, BlasBuilder, VulkanAccelDevice};
//!
//! let device = VulkanAccelDevice::from_context(&ctx);
//! for data in &mut build_data {
//!     unsafe { data.finalize_geometry(&device, flags) };
//! }
//! let size = scratch::scratch_size(budget, &build_data, alignment);
//! // allocate `size` bytes of scratch, then
//! let addresses = scratch::scratch_addresses(budget, &build_data, scratch_address, alignment);
//! let mut builder = BlasBuilder::new(device);
//! ```

pub mod allocator;
pub mod build_data;
pub mod builder;
pub mod device;
pub mod geometry;
pub mod instance;
pub mod scratch;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use allocator::{AccelCreateInfo, AccelKhr, ResourceAllocator, VulkanAccelAllocator};
pub use build_data::{AccelBuildData, BuildConfig};
pub use builder::BlasBuilder;
pub use device::{AccelerationDevice, BuildSizes, VulkanAccelDevice};
pub use geometry::{to_transform_matrix, AabbPositions, AccelGeometryInfo};
pub use instance::{TlasInstance, INSTANCE_STRIDE};
pub use scratch::{ScratchSizeInfo, DEFAULT_SCRATCH_ALIGNMENT};
pub use stats::BlasStats;

/// Default per-call memory budget for [`BlasBuilder`], in bytes.
pub const DEFAULT_HINT_BUDGET: ash::vk::DeviceSize = 512_000_000;
