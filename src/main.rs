//! voltile - volume brick streaming tool
//!
//! Usage:
//!   voltile generate --out <DIR> [--size <VOXELS>] [--brick <VOXELS>] [--levels <N>]
//!                    [--channels <N>] [--format raw|lz4]
//!   voltile fly --volume <DIR> [--steps <N>] [--zoom <UM>] [--config <FILE>]
//!               [--ram <N>] [--gpu <N>] [--jobs <N>]
//!
//! `generate` writes a synthetic multi-resolution raw volume. `fly` opens one,
//! sweeps a camera across it and logs what the tile cache holds at each step.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use voltile::config::TileLoadingConfig;
use voltile::core::camera::{ObservableCamera, Vantage};
use voltile::core::error::Error;
use voltile::core::logging;
use voltile::core::types::{Result, UVec3, Vec3};
use voltile::streaming::{CacheCameraObserver, HeadlessDevice, UiRunQueue, VolumeTileCache};
use voltile::volume::{
    BrickSource, LevelManifest, RawBrickSource, RawFormat, VolumeManifest, volume_center, write_raw_volume,
};

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("generate") => generate(&args[2..]),
        Some("fly") => fly(&args[2..]),
        _ => {
            eprintln!("usage: voltile <generate|fly> [OPTIONS]");
            std::process::exit(2);
        }
    };
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn generate(args: &[String]) -> Result<()> {
    let out = parse_str_arg(args, "--out")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Configuration("--out is required".into()))?;
    let size = parse_u32_arg(args, "--size").unwrap_or(256);
    let brick = parse_u32_arg(args, "--brick").unwrap_or(64);
    let level_count = parse_u32_arg(args, "--levels").unwrap_or(3).max(1);
    let channels = parse_u32_arg(args, "--channels").unwrap_or(1).max(1);
    let format = match parse_str_arg(args, "--format").as_deref() {
        None | Some("raw") => RawFormat::Raw,
        Some("lz4") => RawFormat::Lz4,
        Some(other) => return Err(Error::Configuration(format!("unknown format '{other}'"))),
    };

    let levels = (0..level_count)
        .map(|i| {
            let extent = (size >> i).max(1);
            LevelManifest {
                resolution_um: (1u32 << i) as f64,
                shape: [extent; 3],
                directory: format!("level{i}"),
            }
        })
        .collect();
    let manifest = VolumeManifest {
        name: out
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "synthetic".to_string()),
        channels,
        bytes_per_sample: 2,
        format,
        brick_shape: [brick; 3],
        levels,
    };

    println!("=== voltile generate ===");
    println!("Output:   {}", out.display());
    println!("Size:     {size}^3 voxels, {brick}^3 bricks, {level_count} levels");
    println!("Channels: {channels}, format {:?}", format);

    let start = Instant::now();
    let written = write_raw_volume(&out, &manifest, |level, voxel, channel| {
        synthetic_sample(level, voxel, channel, size)
    })?;
    println!("Wrote {} bricks in {:.2}s", written, start.elapsed().as_secs_f64());
    Ok(())
}

/// A bright shell around the volume center, dimmer per channel
fn synthetic_sample(level: &LevelManifest, voxel: UVec3, channel: u32, size: u32) -> u16 {
    let um = (voxel.as_vec3() + 0.5) * level.resolution_um as f32;
    let center = Vec3::splat(size as f32 * 0.5);
    let radius = size as f32 * 0.35;
    let shell = 1.0 - ((um - center).length() - radius).abs() / (size as f32 * 0.1);
    (shell.clamp(0.0, 1.0) * 4000.0) as u16 >> channel.min(4)
}

fn fly(args: &[String]) -> Result<()> {
    let volume = parse_str_arg(args, "--volume")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Configuration("--volume is required".into()))?;
    let steps = parse_u32_arg(args, "--steps").unwrap_or(32).max(1);

    let mut config = match parse_str_arg(args, "--config") {
        Some(path) => TileLoadingConfig::load_sync(Path::new(&path))?,
        None => TileLoadingConfig::default(),
    };
    if let Some(ram) = parse_usize_arg(args, "--ram") {
        config.ram_tile_count = ram;
    }
    if let Some(gpu) = parse_usize_arg(args, "--gpu") {
        config.gpu_tile_count = gpu;
    }
    if let Some(jobs) = parse_usize_arg(args, "--jobs") {
        config.concurrent_loads = jobs;
    }

    let source = Arc::new(RawBrickSource::open(&volume)?);
    let manifest = source.manifest().clone();
    let center = volume_center(&manifest)
        .ok_or_else(|| Error::Configuration("volume has no levels".into()))?;
    let finest = source.available_resolutions().first().copied().unwrap_or(1.0);
    let zoom = parse_f32_arg(args, "--zoom")
        .unwrap_or(finest as f32 * config.viewport_height_px as f32);

    let (poster, mut ui) = UiRunQueue::new();
    let device = Arc::new(HeadlessDevice::new());
    let cache = VolumeTileCache::new(config, Arc::new(poster), device.clone())?;
    cache.set_source(Some(source));

    let mut camera = ObservableCamera::new(Vantage::new(Vec3::ZERO, zoom));
    camera.add_observer(Arc::new(CacheCameraObserver::new(&cache)));

    println!("=== voltile fly ===");
    println!("Volume: '{}' ({} levels)", manifest.name, manifest.levels.len());
    println!("Zoom:   {zoom} um per viewport height");

    // Sweep along x through the center, edge to edge
    let span = center.x * 2.0;
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        camera.set_focus(Vec3::new(span * t, center.y, center.z));

        let deadline = Instant::now() + Duration::from_millis(50);
        while Instant::now() < deadline && !cache.is_idle() {
            ui.run_pending();
            std::thread::sleep(Duration::from_millis(1));
        }
        ui.run_pending();

        let stats = cache.stats();
        log::info!(
            "step {:>3}: desired {} resident {} ({} KiB) displayed {} | queued {} running {} | done {} failed {} stale {}",
            step,
            stats.desired,
            stats.resident,
            stats.resident_bytes / 1024,
            stats.displayed,
            stats.queued_loads,
            stats.running_loads,
            stats.loads_completed,
            stats.loads_failed,
            stats.loads_discarded
        );
    }

    while !cache.is_idle() {
        ui.run_pending();
        std::thread::sleep(Duration::from_millis(1));
    }
    ui.run_pending();

    let stats = cache.stats();
    println!();
    println!("Loads completed: {}", stats.loads_completed);
    println!("Loads failed:    {}", stats.loads_failed);
    println!("Loads discarded: {}", stats.loads_discarded);
    println!("Device holds {} bricks, {} KiB", device.resident_keys().len(), device.resident_bytes() / 1024);
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
