//! Tile loading preferences
//!
//! The preferences store that persists these values belongs to the host
//! application; this module only defines, validates and (de)serializes them.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Budgets and load parameters consumed by the tile cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLoadingConfig {
    /// Bricks kept in host memory around the camera focus
    pub ram_tile_count: usize,
    /// Bricks uploaded to the display device; at most `ram_tile_count`
    pub gpu_tile_count: usize,
    /// Brick loads allowed to run at once
    pub concurrent_loads: usize,
    /// Edge padding hint forwarded to brick loads (micrometers)
    pub max_edge_pad: f64,
    /// Viewport height used to turn camera zoom into micrometers per pixel
    pub viewport_height_px: u32,
}

impl Default for TileLoadingConfig {
    fn default() -> Self {
        Self {
            ram_tile_count: 4,
            gpu_tile_count: 1,
            concurrent_loads: 1,
            max_edge_pad: 10.0,
            viewport_height_px: 1024,
        }
    }
}

/// Check a RAM/GPU budget pair
pub fn validate_budgets(ram_tile_count: usize, gpu_tile_count: usize) -> Result<()> {
    if ram_tile_count == 0 {
        return Err(Error::Configuration("ram_tile_count must be at least 1".into()));
    }
    if gpu_tile_count == 0 {
        return Err(Error::Configuration("gpu_tile_count must be at least 1".into()));
    }
    if gpu_tile_count > ram_tile_count {
        return Err(Error::Configuration(format!(
            "gpu_tile_count ({gpu_tile_count}) exceeds ram_tile_count ({ram_tile_count})"
        )));
    }
    Ok(())
}

/// Check a worker pool size
pub fn validate_concurrency(concurrent_loads: usize) -> Result<()> {
    if concurrent_loads == 0 {
        return Err(Error::Configuration("concurrent_loads must be at least 1".into()));
    }
    Ok(())
}

impl TileLoadingConfig {
    /// Reject budgets and parameters the cache cannot honor
    pub fn validate(&self) -> Result<()> {
        validate_budgets(self.ram_tile_count, self.gpu_tile_count)?;
        validate_concurrency(self.concurrent_loads)?;
        if !(self.max_edge_pad.is_finite() && self.max_edge_pad >= 0.0) {
            return Err(Error::Configuration(format!(
                "max_edge_pad must be a non-negative number, got {}",
                self.max_edge_pad
            )));
        }
        if self.viewport_height_px == 0 {
            return Err(Error::Configuration("viewport_height_px must be at least 1".into()));
        }
        Ok(())
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}
