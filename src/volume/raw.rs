//! Raw on-disk volumes: a JSON manifest plus one file per brick
//!
//! Layout:
//!   <root>/
//!     volume.json                 # VolumeManifest
//!     <level.directory>/
//!       b_<x>_<y>_<z>.raw         # planar samples, channel-major
//!       ...
//!
//! `<x>_<y>_<z>` is the voxel offset of the brick within its level. With the
//! `lz4` format each file is one LZ4 block with its size prepended.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelToken;
use crate::core::error::Error;
use crate::core::types::{Result, UVec3, Vec3};
use crate::math::Aabb;
use crate::volume::brick::{BrickInfo, BrickKey, BrickPayload, FormatHint, LoadOptions};
use crate::volume::brick_set::BrickInfoSet;
use crate::volume::source::{BrickSource, StaticBrickSource};

/// Manifest file name inside a raw volume directory
pub const MANIFEST_FILE: &str = "volume.json";

/// Bytes read between cancellation checks
const READ_CHUNK_BYTES: usize = 1024 * 1024;

/// Storage format of the brick files
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFormat {
    Raw,
    Lz4,
}

impl From<RawFormat> for FormatHint {
    fn from(format: RawFormat) -> Self {
        match format {
            RawFormat::Raw => FormatHint::Raw,
            RawFormat::Lz4 => FormatHint::Lz4,
        }
    }
}

/// One resolution level of a raw volume
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelManifest {
    /// Micrometers per voxel
    pub resolution_um: f64,
    /// Voxel dimensions of the whole level
    pub shape: [u32; 3],
    /// Directory holding this level's bricks, relative to the volume root
    pub directory: String,
}

/// Contents of `volume.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub name: String,
    pub channels: u32,
    pub bytes_per_sample: u32,
    pub format: RawFormat,
    /// Nominal brick shape; bricks on the far faces are clipped to the level
    pub brick_shape: [u32; 3],
    pub levels: Vec<LevelManifest>,
}

impl VolumeManifest {
    /// Check counts and shapes before any brick is enumerated
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::Configuration("manifest has zero channels".into()));
        }
        if !matches!(self.bytes_per_sample, 1 | 2) {
            return Err(Error::Configuration(format!(
                "unsupported bytes_per_sample {}",
                self.bytes_per_sample
            )));
        }
        if self.brick_shape.contains(&0) {
            return Err(Error::Configuration("brick_shape has a zero edge".into()));
        }
        if self.levels.is_empty() {
            return Err(Error::Configuration("manifest has no levels".into()));
        }
        for level in &self.levels {
            if !(level.resolution_um.is_finite() && level.resolution_um > 0.0) {
                return Err(Error::Configuration(format!(
                    "level {} has invalid resolution {}",
                    level.directory, level.resolution_um
                )));
            }
            if level.shape.contains(&0) {
                return Err(Error::Configuration(format!(
                    "level {} has an empty shape",
                    level.directory
                )));
            }
        }
        Ok(())
    }

    /// Read and validate a manifest
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest as pretty JSON, creating parent directories
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Voxel offsets and clipped shapes of every brick of `level`, x fastest
    pub fn brick_grid(&self, level: &LevelManifest) -> Vec<(UVec3, UVec3)> {
        let shape = UVec3::from_array(level.shape);
        let step = UVec3::from_array(self.brick_shape);
        let mut grid = Vec::new();
        for z in (0..shape.z).step_by(step.z as usize) {
            for y in (0..shape.y).step_by(step.y as usize) {
                for x in (0..shape.x).step_by(step.x as usize) {
                    let offset = UVec3::new(x, y, z);
                    grid.push((offset, step.min(shape - offset)));
                }
            }
        }
        grid
    }
}

/// File stem of the brick at `offset`; the extension comes from the format
fn brick_stem(level_dir: &Path, offset: UVec3) -> PathBuf {
    level_dir.join(format!("b_{}_{}_{}", offset.x, offset.y, offset.z))
}

/// A brick stored as one file in a raw volume
#[derive(Debug)]
pub struct RawBrick {
    key: BrickKey,
    stem: PathBuf,
    bounds: Aabb,
    shape: UVec3,
    channels: u32,
    bytes_per_sample: u32,
}

impl RawBrick {
    fn file_path(&self, format: FormatHint) -> PathBuf {
        self.stem.with_extension(format.extension())
    }

    fn read_chunked(&self, file: &mut File, len: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            cancel.check()?;
            let end = (filled + READ_CHUNK_BYTES).min(len);
            file.read_exact(&mut buf[filled..end])
                .map_err(|e| Error::load_io(self.key.to_string(), e))?;
            filled = end;
        }
        Ok(buf)
    }

    fn load_raw(&self, options: &LoadOptions, cancel: &CancelToken) -> Result<Vec<u8>> {
        let path = self.file_path(FormatHint::Raw);
        let plane = BrickPayload::expected_len(self.shape, 1, self.bytes_per_sample);
        let mut file = File::open(&path).map_err(|e| Error::load_io(self.key.to_string(), e))?;
        file.seek(SeekFrom::Start((plane * options.channel as usize) as u64))
            .map_err(|e| Error::load_io(self.key.to_string(), e))?;
        self.read_chunked(&mut file, plane, cancel)
    }

    fn load_lz4(&self, options: &LoadOptions, cancel: &CancelToken) -> Result<Vec<u8>> {
        let path = self.file_path(FormatHint::Lz4);
        let mut file = File::open(&path).map_err(|e| Error::load_io(self.key.to_string(), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::load_io(self.key.to_string(), e))?
            .len() as usize;
        let compressed = self.read_chunked(&mut file, len, cancel)?;
        cancel.check()?;

        let samples = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
            Error::load_decode(self.key.to_string(), format!("LZ4 decompression failed: {e}"))
        })?;
        let full = BrickPayload::expected_len(self.shape, self.channels, self.bytes_per_sample);
        if samples.len() != full {
            return Err(Error::load_decode(
                self.key.to_string(),
                format!("expected {} decompressed bytes, got {}", full, samples.len()),
            ));
        }
        let plane = full / self.channels as usize;
        let start = plane * options.channel as usize;
        Ok(samples[start..start + plane].to_vec())
    }
}

impl BrickInfo for RawBrick {
    fn key(&self) -> &BrickKey {
        &self.key
    }

    fn bounding_box(&self) -> Aabb {
        self.bounds
    }

    fn voxel_shape(&self) -> UVec3 {
        self.shape
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn bytes_per_sample(&self) -> u32 {
        self.bytes_per_sample
    }

    fn load(&self, options: &LoadOptions, cancel: &CancelToken) -> Result<BrickPayload> {
        cancel.check()?;
        if options.channel >= self.channels {
            return Err(Error::load_decode(
                self.key.to_string(),
                format!("channel {} out of {}", options.channel, self.channels),
            ));
        }
        let data = match options.format {
            FormatHint::Raw => self.load_raw(options, cancel)?,
            FormatHint::Lz4 => self.load_lz4(options, cancel)?,
            other => {
                return Err(Error::load_decode(
                    self.key.to_string(),
                    format!("raw volumes cannot decode {other:?}"),
                ));
            }
        };
        BrickPayload::new(self.shape, 1, self.bytes_per_sample, data)
    }
}

/// Source over a raw volume directory
#[derive(Debug)]
pub struct RawBrickSource {
    root: PathBuf,
    manifest: VolumeManifest,
    levels: StaticBrickSource,
}

impl RawBrickSource {
    /// Open `root/volume.json` and enumerate every brick of every level
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest = VolumeManifest::load_sync(&root.join(MANIFEST_FILE))?;
        let mut levels = StaticBrickSource::new(manifest.format.into());

        for level in &manifest.levels {
            let level_dir = root.join(&level.directory);
            let resolution = level.resolution_um;
            let mut set = BrickInfoSet::new(resolution);
            for (offset, shape) in manifest.brick_grid(level) {
                let stem = brick_stem(&level_dir, offset);
                let relative = format!("{}/b_{}_{}_{}", level.directory, offset.x, offset.y, offset.z);
                let origin = offset.as_vec3() * resolution as f32;
                set.insert(Arc::new(RawBrick {
                    key: BrickKey::new(relative, offset, resolution),
                    stem,
                    bounds: Aabb::from_origin_size(origin, shape.as_vec3() * resolution as f32),
                    shape,
                    channels: manifest.channels,
                    bytes_per_sample: manifest.bytes_per_sample,
                }))?;
            }
            levels.add_level(set)?;
        }

        log::info!(
            "Opened raw volume '{}' at {}: {} levels, {} bricks",
            manifest.name,
            root.display(),
            manifest.levels.len(),
            levels.brick_count()
        );
        Ok(Self { root, manifest, levels })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }
}

impl BrickSource for RawBrickSource {
    fn available_resolutions(&self) -> Vec<f64> {
        self.levels.available_resolutions()
    }

    fn brick_set_for_resolution(&self, resolution: f64) -> Option<Arc<BrickInfoSet>> {
        self.levels.brick_set_for_resolution(resolution)
    }

    fn format_hint(&self) -> FormatHint {
        self.levels.format_hint()
    }
}

/// Write a complete raw volume, sampling every voxel through `sample`.
///
/// `sample` receives the level, the voxel position within that level and
/// the channel, and returns the intensity (truncated to 8 bits when the
/// manifest stores one byte per sample). Returns the number of bricks written.
pub fn write_raw_volume<F>(root: &Path, manifest: &VolumeManifest, sample: F) -> Result<usize>
where
    F: Fn(&LevelManifest, UVec3, u32) -> u16,
{
    manifest.validate()?;
    manifest.save_sync(&root.join(MANIFEST_FILE))?;

    let format: FormatHint = manifest.format.into();
    let mut written = 0;
    for level in &manifest.levels {
        let level_dir = root.join(&level.directory);
        std::fs::create_dir_all(&level_dir)?;

        for (offset, shape) in manifest.brick_grid(level) {
            let len = BrickPayload::expected_len(shape, manifest.channels, manifest.bytes_per_sample);
            let mut bytes = Vec::with_capacity(len);
            for channel in 0..manifest.channels {
                for z in 0..shape.z {
                    for y in 0..shape.y {
                        for x in 0..shape.x {
                            let value = sample(level, offset + UVec3::new(x, y, z), channel);
                            if manifest.bytes_per_sample == 1 {
                                bytes.push(value as u8);
                            } else {
                                bytes.extend_from_slice(&value.to_le_bytes());
                            }
                        }
                    }
                }
            }
            let bytes = match manifest.format {
                RawFormat::Raw => bytes,
                RawFormat::Lz4 => lz4_flex::compress_prepend_size(&bytes),
            };
            std::fs::write(brick_stem(&level_dir, offset).with_extension(format.extension()), bytes)?;
            written += 1;
        }
    }
    log::info!("Wrote {} bricks for '{}' to {}", written, manifest.name, root.display());
    Ok(written)
}

/// Centroid of the whole finest level, handy as an initial camera focus
pub fn volume_center(manifest: &VolumeManifest) -> Option<Vec3> {
    manifest
        .levels
        .iter()
        .min_by(|a, b| a.resolution_um.total_cmp(&b.resolution_um))
        .map(|level| UVec3::from_array(level.shape).as_vec3() * level.resolution_um as f32 * 0.5)
}
