//! Headless BLAS build and compaction demo.
//!
//! Builds a set of procedural AABB bottom-level acceleration structures in
//! budgeted batches, compacts them, builds a TLAS over the result and
//! reports the memory saved.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p raykit-blas-demo
//! cargo run -p raykit-blas-demo -- --count 1000 --budget 16000000 --scratch-budget 2000000
//! RUST_LOG=raykit_accel=debug cargo run -p raykit-blas-demo -- --serial
//! ```

mod config;
mod scene;

use std::time::Instant;

use anyhow::Context;
use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_accel::scratch::{self, align_up};
use raykit_accel::{
    AabbPositions, AccelBuildData, AccelGeometryInfo, AccelKhr, BlasBuilder, ResourceAllocator,
    TlasInstance, VulkanAccelAllocator, VulkanAccelDevice, INSTANCE_STRIDE,
};
use raykit_gpu::command::execute_single_time_commands;
use raykit_gpu::{CommandPool, GpuContext, GpuContextBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::DemoConfig;

fn main() -> anyhow::Result<()> {
    let config = DemoConfig::from_args()?;
    if config.help {
        config::print_help();
        return Ok(());
    }

    init_tracing();

    let ctx = GpuContextBuilder::new()
        .app_name("raykit-blas-demo")
        .build()
        .context("failed to create GPU context")?;

    run(&ctx, &config)
}

fn init_tracing() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,raykit_accel=trace,raykit_gpu=trace"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

#[allow(clippy::cast_precision_loss)]
fn run(ctx: &GpuContext, config: &DemoConfig) -> anyhow::Result<()> {
    let device = VulkanAccelDevice::from_context(ctx);
    let alignment =
        scratch::scratch_alignment(ctx.capabilities().ray_tracing.min_scratch_offset_alignment);
    let queue = ctx.queue();
    let pool = unsafe {
        CommandPool::new(
            ctx.device(),
            ctx.queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?
    };

    let mut guard = ctx.allocator().lock();
    let mut alloc = VulkanAccelAllocator::new(&mut guard, device.loader());

    // Geometry
    let aabbs = scene::make_aabbs(config.count);
    let mut aabb_buffer = alloc.create_buffer(
        AabbPositions::STRIDE * aabbs.len() as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
        "aabb_buffer",
    )?;
    aabb_buffer.write(&aabbs)?;
    let aabb_address = aabb_buffer.device_address(ctx.device());

    let flags = if config.compact {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
    } else {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
    };

    let mut build_data = Vec::with_capacity(config.count);
    let mut first_box: u64 = 0;
    for index in 0..config.count {
        let boxes = scene::box_count(index);
        let mut data = AccelBuildData::blas();
        data.add_geometry_info(AccelGeometryInfo::aabbs(
            aabb_address + first_box * AabbPositions::STRIDE,
            boxes,
        ));
        unsafe { data.finalize_geometry(&device, flags) };
        build_data.push(data);
        first_box += u64::from(boxes);
    }

    // Scratch
    let scratch_size = if config.serial {
        scratch::aligned_scratch_sizes(&build_data, alignment).max_scratch
    } else {
        scratch::scratch_size(config.scratch_budget, &build_data, alignment)
    };
    let mut scratch_buffer = alloc.create_buffer(
        scratch_size + u64::from(alignment),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "scratch_buffer",
    )?;
    let scratch_base = align_up(
        scratch_buffer.device_address(ctx.device()),
        u64::from(alignment),
    );
    let scratch_addresses =
        scratch::scratch_addresses(config.scratch_budget, &build_data, scratch_base, alignment);

    info!(
        count = config.count,
        scratch_size,
        scratch_slots = if config.serial { 1 } else { scratch_addresses.len() },
        budget = config.budget,
        "Building BLAS"
    );

    // Build and compact
    let mut builder = BlasBuilder::new(device.clone());
    let mut blas: Vec<AccelKhr> = std::iter::repeat_with(AccelKhr::default)
        .take(config.count)
        .collect();
    let start = Instant::now();
    let mut submissions = 0usize;

    loop {
        let done = unsafe {
            execute_single_time_commands(ctx.device(), &pool, queue, |cmd| {
                if config.serial {
                    builder.cmd_create_blas(
                        &mut alloc,
                        cmd,
                        &mut build_data,
                        &mut blas,
                        scratch_base,
                        config.budget,
                    )
                } else {
                    builder.cmd_create_parallel_blas(
                        &mut alloc,
                        cmd,
                        &mut build_data,
                        &mut blas,
                        &scratch_addresses,
                        config.budget,
                    )
                }
            })?
        };
        submissions += 1;

        if config.compact {
            unsafe {
                execute_single_time_commands(ctx.device(), &pool, queue, |cmd| {
                    builder.cmd_compact_blas(&mut alloc, cmd, &mut build_data, &mut blas)
                })?;
                builder.destroy_non_compacted_blas(&mut alloc)?;
            }
        }

        if done {
            break;
        }
    }

    let total_size: u64 = blas.iter().map(AccelKhr::size).sum();
    info!(
        submissions,
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        total_mb = total_size as f64 / (1024.0 * 1024.0),
        "Built {} BLAS",
        blas.len()
    );
    if config.compact {
        info!("{}", builder.statistics());
    }

    // TLAS over every BLAS
    let instances: Vec<vk::AccelerationStructureInstanceKHR> = blas
        .iter()
        .enumerate()
        .map(|(index, b)| {
            let custom_index = u32::try_from(index).unwrap_or(u32::MAX) & 0x00FF_FFFF;
            TlasInstance::new(b.address)
                .with_transform(scene::grid_transform(index, blas.len()))
                .with_custom_index(custom_index)
                .to_vk()
        })
        .collect();
    let instance_count = u32::try_from(instances.len()).context("too many instances")?;

    let mut instance_buffer = alloc.create_buffer(
        INSTANCE_STRIDE * u64::from(instance_count),
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
        "tlas_instance_buffer",
    )?;
    instance_buffer.write(&instances)?;

    let mut tlas_data = AccelBuildData::tlas();
    let instance_geometry = tlas_data
        .make_instance_geometry(instance_count, instance_buffer.device_address(ctx.device()));
    tlas_data.add_geometry_info(instance_geometry);
    let tlas_sizes = unsafe {
        tlas_data.finalize_geometry(
            &device,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        )
    };

    let mut tlas = alloc.create_acceleration(&tlas_data.make_create_info())?;
    let mut tlas_scratch = alloc.create_buffer(
        tlas_sizes.build_scratch_size + u64::from(alignment),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "tlas_scratch_buffer",
    )?;
    let tlas_scratch_address = align_up(
        tlas_scratch.device_address(ctx.device()),
        u64::from(alignment),
    );

    unsafe {
        execute_single_time_commands(ctx.device(), &pool, queue, |cmd| {
            tlas_data.cmd_build_acceleration_structure(
                &device,
                cmd,
                tlas.accel,
                tlas_scratch_address,
            );
            Ok(())
        })?;
    }
    info!(
        instances = instance_count,
        size = tlas.size(),
        "Built TLAS"
    );

    // Cleanup
    alloc.destroy_acceleration(&mut tlas)?;
    alloc.destroy_buffer(&mut tlas_scratch)?;
    alloc.destroy_buffer(&mut instance_buffer)?;
    for accel in &mut blas {
        alloc.destroy_acceleration(accel)?;
    }
    unsafe { builder.destroy(&mut alloc)? };
    alloc.destroy_buffer(&mut scratch_buffer)?;
    alloc.destroy_buffer(&mut aabb_buffer)?;
    drop(alloc);
    drop(guard);
    unsafe { pool.destroy(ctx.device()) };

    Ok(())
}
