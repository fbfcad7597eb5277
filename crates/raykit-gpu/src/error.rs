//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<gpu_allocator::AllocationError> for GpuError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::AllocationFailed(err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
