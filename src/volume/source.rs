//! Dataset sources: the capability interface and an in-memory implementation

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::volume::brick::FormatHint;
use crate::volume::brick_set::BrickInfoSet;

/// A multi-resolution dataset enumerated into bricks.
///
/// Called from the cache's control path, so implementations should answer
/// from metadata gathered when the dataset was opened.
pub trait BrickSource: Send + Sync + fmt::Debug {
    /// Available resolution levels in micrometers per voxel, finest first
    fn available_resolutions(&self) -> Vec<f64>;

    /// Brick index for one resolution level
    fn brick_set_for_resolution(&self, resolution: f64) -> Option<Arc<BrickInfoSet>>;

    /// Format hint passed through to [`BrickInfo::load`](crate::volume::BrickInfo::load)
    fn format_hint(&self) -> FormatHint;
}

/// Resolution key ordering `f64` by bit pattern of positive values
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ResolutionKey(u64);

impl ResolutionKey {
    fn new(resolution: f64) -> Self {
        Self(resolution.to_bits())
    }
}

/// Source whose brick sets are fully built up front
#[derive(Debug, Default)]
pub struct StaticBrickSource {
    levels: BTreeMap<ResolutionKey, Arc<BrickInfoSet>>,
    format: FormatHint,
}

impl StaticBrickSource {
    pub fn new(format: FormatHint) -> Self {
        Self {
            levels: BTreeMap::new(),
            format,
        }
    }

    /// Register a resolution level; each resolution may appear once
    pub fn add_level(&mut self, set: BrickInfoSet) -> Result<()> {
        let resolution = set.resolution();
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(Error::Configuration(format!("invalid resolution {resolution}")));
        }
        let key = ResolutionKey::new(resolution);
        if self.levels.contains_key(&key) {
            return Err(Error::Configuration(format!(
                "resolution {resolution} registered twice"
            )));
        }
        log::debug!("Registered resolution {:.3} um/vx with {} bricks", resolution, set.len());
        self.levels.insert(key, Arc::new(set));
        Ok(())
    }

    /// Builder-style [`add_level`](Self::add_level)
    pub fn with_level(mut self, set: BrickInfoSet) -> Result<Self> {
        self.add_level(set)?;
        Ok(self)
    }

    /// Total bricks across all levels
    pub fn brick_count(&self) -> usize {
        self.levels.values().map(|s| s.len()).sum()
    }
}

impl BrickSource for StaticBrickSource {
    fn available_resolutions(&self) -> Vec<f64> {
        // Positive finite f64 bit patterns sort like the values themselves
        self.levels.keys().map(|k| f64::from_bits(k.0)).collect()
    }

    fn brick_set_for_resolution(&self, resolution: f64) -> Option<Arc<BrickInfoSet>> {
        self.levels.get(&ResolutionKey::new(resolution)).cloned()
    }

    fn format_hint(&self) -> FormatHint {
        self.format
    }
}
