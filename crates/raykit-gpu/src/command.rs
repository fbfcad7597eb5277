//! Command buffer management.

use crate::error::Result;
use crate::sync::{create_fence, wait_for_fence};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers[0])
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Record, submit and wait for a one-time command buffer.
///
/// The closure's error aborts the submission; the command buffer is freed
/// on every path.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn execute_single_time_commands<F, T>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<T>
where
    F: FnOnce(vk::CommandBuffer) -> Result<T>,
{
    let cmd = unsafe { pool.allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)? };

    let result = unsafe { record_and_submit(device, cmd, queue, f) };

    unsafe { device.free_command_buffers(pool.handle(), &[cmd]) };

    result
}

unsafe fn record_and_submit<F, T>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    queue: vk::Queue,
    f: F,
) -> Result<T>
where
    F: FnOnce(vk::CommandBuffer) -> Result<T>,
{
    unsafe { begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)? };
    let value = f(cmd)?;
    unsafe { end_command_buffer(device, cmd)? };

    let fence = unsafe { create_fence(device, false)? };
    let cmd_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
    let submitted = unsafe { device.queue_submit(queue, &[submit_info], fence) }
        .map_err(Into::into)
        .and_then(|()| unsafe { wait_for_fence(device, fence, u64::MAX) });
    unsafe { device.destroy_fence(fence, None) };
    submitted?;

    Ok(value)
}
