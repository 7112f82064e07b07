//! Headless bring-up probe for the Terra core
//!
//! Loads an engine config, brings the core up against a headless surface (or
//! device-only when the driver has none), prints what was resolved and tears
//! everything down in priority order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ash::vk;
use clap::{Arg, ArgAction, Command};
use log::{info, warn};
use terra_engine::foundation::logging;
use terra_engine::prelude::*;
use terra_engine::vulkan::SurfaceTarget;

const PROBE_UNIFORMS: Slot<ResourceView> = Slot::new("probe_uniforms");
const PROBE_DESCRIPTORS: Slot<DescriptorSetManager> = Slot::new("probe_descriptors");

const UNIFORM_SIZE: u64 = 256;

fn main() -> Result<()> {
    let matches = Command::new("terra_probe")
        .about("Brings the Terra core up headlessly and reports the resolved GPU state")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Engine config (.toml or .ron)"),
        )
        .arg(
            Arg::new("frames")
                .short('f')
                .long("frames")
                .value_name("COUNT")
                .help("Override frames in flight"),
        )
        .arg(
            Arg::new("device-only")
                .long("device-only")
                .help("Skip the headless surface and swapchain")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("validation")
                .long("validation")
                .help("Request the Khronos validation layer")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("write-default")
                .long("write-default")
                .value_name("FILE")
                .help("Write the default config to FILE and exit"),
        )
        .get_matches();

    if let Some(path) = matches.get_one::<String>("write-default") {
        EngineConfig::default()
            .save_to_file(path)
            .with_context(|| format!("Failed to write default config to {path}"))?;
        println!("Wrote default config to {path}");
        return Ok(());
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::load_from_file(PathBuf::from(path))
            .with_context(|| format!("Failed to load config {path}"))?,
        None => EngineConfig::default(),
    };
    if let Some(frames) = matches.get_one::<String>("frames") {
        config.renderer.frames_in_flight = frames.parse().context("Invalid frame count")?;
    }
    if matches.get_flag("validation") {
        config.renderer.enable_validation = Some(true);
    }
    config.validate().context("Invalid engine config")?;
    logging::init(&config.log_level);

    let mut terra = if matches.get_flag("device-only") {
        bring_up(&config.renderer, false)?
    } else {
        match bring_up(&config.renderer, true) {
            Ok(terra) => terra,
            Err(error) => {
                warn!("Headless surface unavailable ({error:#}); falling back to device-only");
                bring_up(&config.renderer, false)?
            }
        }
    };

    create_probe_resources(&mut terra).context("Failed to create probe resources")?;
    report(&terra)?;

    terra.flush_uploads(false)?;
    terra.shutdown().context("Shutdown failed")?;
    info!("Probe finished");
    Ok(())
}

fn bring_up(config: &RendererConfig, with_surface: bool) -> Result<Terra> {
    let mut terra = Terra::new(config.clone());
    let target = SurfaceTarget::Headless;

    if with_surface {
        terra.init_instance(Some(&target)).context("Instance creation failed")?;
        terra.init_surface(&target).context("Surface creation failed")?;
    } else {
        terra.init_instance(None).context("Instance creation failed")?;
    }
    terra.init_device().context("Device creation failed")?;
    terra.init_sync_objects().context("Sync object creation failed")?;
    if with_surface {
        let extent = terra.display_extent()?.unwrap_or_else(|| config.extent());
        terra.init_swapchain(extent).context("Swapchain creation failed")?;
    }
    Ok(terra)
}

/// One uniform view split per frame plus the descriptor sets pointing at it
fn create_probe_resources(terra: &mut Terra) -> VulkanResult<()> {
    let frames = terra.config().frames_in_flight;
    let device = terra.device()?.raw().clone();
    let families = terra.device()?.unique_family_indices();

    let mut uniforms = ResourceView::new();
    {
        let allocator = terra.allocator_mut()?;
        uniforms.create_resource(
            allocator,
            UNIFORM_SIZE,
            frames,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            &families,
        )?;
        uniforms.set_memory_offset_and_type(allocator, MemoryClass::CpuWritable)?;
        allocator.allocate_memory(MemoryClass::CpuWritable)?;
        uniforms.bind_resource_to_memory(allocator)?;
        for frame in 0..frames {
            uniforms.write_slot(allocator, frame, &[0; UNIFORM_SIZE as usize])?;
        }
    }

    let mut descriptors = DescriptorSetManager::new(frames)?;
    descriptors.add_view_split(
        DescriptorInfo::uniform(0),
        &uniforms,
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    )?;
    descriptors.create_descriptor_sets(&device)?;

    let objects = terra.objects_mut();
    objects.create_object(&PROBE_UNIFORMS, uniforms, priority::RESOURCES)?;
    objects.create_object(&PROBE_DESCRIPTORS, descriptors, priority::RESOURCES)?;
    Ok(())
}

fn report(terra: &Terra) -> Result<()> {
    let device = terra.device()?;
    let physical = device.physical();
    println!("GPU: {} ({:?})", physical.name(), physical.properties.device_type);

    for role in QueueRole::ALL {
        let queue = device.queue(role);
        let sync = terra.sync(role)?;
        println!(
            "  {role:<8} family {} index {} | {} sync slots",
            queue.family,
            queue.index,
            sync.slot_count()
        );
    }

    let alignments = physical.buffer_alignments();
    println!(
        "  alignments: uniform {} storage {} texel {}",
        alignments.uniform, alignments.storage, alignments.texel
    );
    println!("  memory blocks: {}", terra.allocator()?.block_count());

    match terra.swapchain() {
        Ok(swapchain) => println!(
            "  swapchain: {} images {}x{} {:?} {:?}",
            swapchain.image_count(),
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.format().format,
            swapchain.present_mode()
        ),
        Err(_) => println!("  swapchain: none (device-only)"),
    }

    let descriptors = terra.objects().get(&PROBE_DESCRIPTORS)?;
    println!("  descriptor sets: {}", descriptors.set_count());

    println!("Teardown order:");
    for (slot, order) in terra.objects().teardown_order() {
        println!("  [{order}] {slot}");
    }
    Ok(())
}
