//! Bricks whose samples already live in memory
//!
//! Used for single tiles handed to the cache by a caller, for synthetic
//! datasets, and by tests and benches.

use std::sync::Arc;

use crate::core::cancel::CancelToken;
use crate::core::error::Error;
use crate::core::types::{Result, UVec3, Vec3};
use crate::math::Aabb;
use crate::volume::brick::{BrickInfo, BrickKey, BrickPayload, LoadOptions};

/// A brick backed by an in-memory planar sample buffer
#[derive(Debug, Clone)]
pub struct MemoryBrick {
    key: BrickKey,
    bounds: Aabb,
    shape: UVec3,
    channels: u32,
    bytes_per_sample: u32,
    /// Channel-major samples
    samples: Arc<Vec<u8>>,
}

impl MemoryBrick {
    /// Create a brick whose min corner sits at `origin` micrometers
    pub fn new(
        path: impl Into<Arc<str>>,
        origin: Vec3,
        shape: UVec3,
        resolution: f64,
        channels: u32,
        bytes_per_sample: u32,
        samples: Vec<u8>,
    ) -> Result<Self> {
        let expected = BrickPayload::expected_len(shape, channels, bytes_per_sample);
        let path = path.into();
        if samples.len() != expected {
            return Err(Error::load_decode(
                path.to_string(),
                format!("expected {} bytes, got {}", expected, samples.len()),
            ));
        }
        let offset = (origin / resolution as f32).round().max(Vec3::ZERO).as_uvec3();
        Ok(Self {
            key: BrickKey::new(path, offset, resolution),
            bounds: Aabb::from_origin_size(origin, shape.as_vec3() * resolution as f32),
            shape,
            channels,
            bytes_per_sample,
            samples: Arc::new(samples),
        })
    }

    /// Single-channel 8-bit brick with every sample set to `value`
    pub fn filled(
        path: impl Into<Arc<str>>,
        origin: Vec3,
        shape: UVec3,
        resolution: f64,
        value: u8,
    ) -> Self {
        let len = BrickPayload::expected_len(shape, 1, 1);
        let offset = (origin / resolution as f32).round().max(Vec3::ZERO).as_uvec3();
        Self {
            key: BrickKey::new(path, offset, resolution),
            bounds: Aabb::from_origin_size(origin, shape.as_vec3() * resolution as f32),
            shape,
            channels: 1,
            bytes_per_sample: 1,
            samples: Arc::new(vec![value; len]),
        }
    }
}

impl BrickInfo for MemoryBrick {
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
        let plane = BrickPayload::expected_len(self.shape, 1, self.bytes_per_sample);
        let start = plane * options.channel as usize;
        BrickPayload::new(
            self.shape,
            1,
            self.bytes_per_sample,
            self.samples[start..start + plane].to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_selects_channel() {
        let brick = MemoryBrick::new(
            "two-channel",
            Vec3::ZERO,
            UVec3::new(2, 1, 1),
            0.5,
            2,
            1,
            vec![1, 1, 7, 7],
        )
        .unwrap();
        let options = LoadOptions { channel: 1, ..Default::default() };
        let payload = brick.load(&options, &CancelToken::new()).unwrap();
        assert_eq!(payload.data, vec![7, 7]);
        assert!(payload.matches(&brick));
        assert_eq!(brick.bounding_box().max, Vec3::new(1.0, 0.5, 0.5));
    }

    #[test]
    fn test_load_checks_cancel_and_channel() {
        let brick = MemoryBrick::filled("f", Vec3::ZERO, UVec3::splat(2), 1.0, 3);

        let token = CancelToken::new();
        token.cancel();
        assert!(brick.load(&LoadOptions::default(), &token).unwrap_err().is_canceled());

        let options = LoadOptions { channel: 1, ..Default::default() };
        assert!(matches!(
            brick.load(&options, &CancelToken::new()),
            Err(Error::LoadDecode { .. })
        ));
    }

    #[test]
    fn test_offset_from_origin() {
        let brick = MemoryBrick::filled("o", Vec3::new(8.0, 4.0, 0.0), UVec3::splat(4), 2.0, 0);
        assert_eq!(brick.key().offset(), UVec3::new(4, 2, 0));
    }
}
