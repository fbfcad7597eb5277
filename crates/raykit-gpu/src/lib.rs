//! Vulkan device layer for raykit.
//!
//! This crate provides:
//! - Headless Vulkan instance and device creation with the
//!   acceleration structure extensions enabled
//! - GPU capability detection, including ray tracing limits
//! - Memory allocation via gpu-allocator
//! - Command buffer and fence helpers

pub mod capabilities;
pub mod command;
pub mod context;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use sync::{create_fence, wait_for_fence};
