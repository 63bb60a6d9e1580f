//! Brick identity, metadata and host-memory payload

use std::fmt;
use std::sync::Arc;

use crate::core::cancel::CancelToken;
use crate::core::error::Error;
use crate::core::types::{Result, UVec3};
use crate::math::Aabb;

/// Stable identity of a brick: relative path, voxel offset and resolution.
///
/// Two `BrickInfo` values describe the same brick exactly when their keys are
/// equal, regardless of which source instance produced them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrickKey {
    path: Arc<str>,
    offset: [u32; 3],
    resolution_bits: u64,
}

impl BrickKey {
    /// Create a key; `resolution` is in micrometers per voxel
    pub fn new(path: impl Into<Arc<str>>, offset: UVec3, resolution: f64) -> Self {
        Self {
            path: path.into(),
            offset: offset.to_array(),
            resolution_bits: resolution.to_bits(),
        }
    }

    /// Relative path of the brick within its dataset
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Voxel offset of the brick's min corner within its resolution level
    pub fn offset(&self) -> UVec3 {
        UVec3::from_array(self.offset)
    }

    /// Resolution in micrometers per voxel
    pub fn resolution(&self) -> f64 {
        f64::from_bits(self.resolution_bits)
    }
}

impl fmt::Display for BrickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @[{}, {}, {}] ({:.3} um/vx)",
            self.path,
            self.offset[0],
            self.offset[1],
            self.offset[2],
            self.resolution()
        )
    }
}

/// File format a source stores its bricks in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FormatHint {
    /// Uncompressed planar samples
    #[default]
    Raw,
    /// LZ4 block with prepended size
    Lz4,
    Ktx,
    OmeZarr,
}

impl FormatHint {
    /// File extension used for bricks of this format
    pub fn extension(self) -> &'static str {
        match self {
            FormatHint::Raw => "raw",
            FormatHint::Lz4 => "lz4",
            FormatHint::Ktx => "ktx",
            FormatHint::OmeZarr => "zarr",
        }
    }
}

/// Parameters passed to [`BrickInfo::load`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadOptions {
    /// Micrometers of overlapping edge a format may trim from each face
    pub max_edge_pad: f64,
    /// Color channel to load
    pub channel: u32,
    pub format: FormatHint,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_edge_pad: 10.0,
            channel: 0,
            format: FormatHint::Raw,
        }
    }
}

/// Pixel data of one channel of a brick, resident in host memory
#[derive(Clone, PartialEq)]
pub struct BrickPayload {
    pub shape: UVec3,
    pub channels: u32,
    pub bytes_per_sample: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for BrickPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrickPayload")
            .field("shape", &self.shape)
            .field("channels", &self.channels)
            .field("bytes_per_sample", &self.bytes_per_sample)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .finish()
    }
}

impl BrickPayload {
    /// Create a payload, checking the buffer length against the dimensions
    pub fn new(shape: UVec3, channels: u32, bytes_per_sample: u32, data: Vec<u8>) -> Result<Self> {
        let expected = Self::expected_len(shape, channels, bytes_per_sample);
        if data.len() != expected {
            return Err(Error::load_decode(
                format!("{}x{}x{}", shape.x, shape.y, shape.z),
                format!("expected {} bytes, got {}", expected, data.len()),
            ));
        }
        Ok(Self { shape, channels, bytes_per_sample, data })
    }

    /// Byte length of a payload with the given dimensions
    pub fn expected_len(shape: UVec3, channels: u32, bytes_per_sample: u32) -> usize {
        shape.x as usize
            * shape.y as usize
            * shape.z as usize
            * channels as usize
            * bytes_per_sample as usize
    }

    /// Size of the buffer in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Whether this payload has the voxel shape `brick` declares
    pub fn matches(&self, brick: &dyn BrickInfo) -> bool {
        self.shape == brick.voxel_shape()
    }

    /// View 16-bit samples; `None` if samples are not 2 bytes or the buffer is misaligned
    pub fn samples_u16(&self) -> Option<&[u16]> {
        if self.bytes_per_sample != 2 {
            return None;
        }
        bytemuck::try_cast_slice(&self.data).ok()
    }
}

/// Metadata of one fixed-extent block of a dataset at one resolution.
///
/// Implemented once per dataset format. `load` is invoked from worker
/// threads and must tolerate concurrent calls on distinct bricks.
pub trait BrickInfo: Send + Sync + fmt::Debug {
    /// Stable identity used for equality and hashing
    fn key(&self) -> &BrickKey;

    /// Bounds in micrometers
    fn bounding_box(&self) -> Aabb;

    /// Voxel dimensions
    fn voxel_shape(&self) -> UVec3;

    fn channel_count(&self) -> u32;

    fn bytes_per_sample(&self) -> u32;

    /// Micrometers per voxel
    fn resolution(&self) -> f64 {
        self.key().resolution()
    }

    /// Synchronously read one channel of this brick into host memory.
    ///
    /// Long-running implementations should poll `cancel` and return
    /// `Error::Canceled` once it is set.
    fn load(&self, options: &LoadOptions, cancel: &CancelToken) -> Result<BrickPayload>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_identity() {
        let a = BrickKey::new("level0/b_0_0_0", UVec3::ZERO, 1.0);
        let b = BrickKey::new(String::from("level0/b_0_0_0"), UVec3::ZERO, 1.0);
        let c = BrickKey::new("level0/b_0_0_0", UVec3::ZERO, 2.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.resolution(), 2.0);
        assert_eq!(a.to_string(), "level0/b_0_0_0 @[0, 0, 0] (1.000 um/vx)");
    }

    #[test]
    fn test_payload_length_checked() {
        let shape = UVec3::new(2, 2, 2);
        assert!(BrickPayload::new(shape, 1, 2, vec![0; 16]).is_ok());

        let err = BrickPayload::new(shape, 1, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(err, Error::LoadDecode { .. }));
    }

    #[test]
    fn test_samples_u16() {
        let payload = BrickPayload::new(UVec3::new(2, 1, 1), 1, 2, vec![1, 0, 2, 0]).unwrap();
        if let Some(samples) = payload.samples_u16() {
            assert_eq!(samples, &[1, 2]);
        }

        let bytes = BrickPayload::new(UVec3::new(2, 1, 1), 1, 1, vec![1, 2]).unwrap();
        assert!(bytes.samples_u16().is_none());
    }
}
