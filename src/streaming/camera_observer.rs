//! Forwards camera vantage changes into a tile cache

use crate::core::camera::{CameraObserver, Vantage};
use crate::streaming::tile_cache::{VolumeTileCache, WeakTileCache};

/// Camera observer that drives [`VolumeTileCache::on_camera_changed`].
///
/// Holds the cache weakly so a camera outliving its cache is harmless.
pub struct CacheCameraObserver {
    cache: WeakTileCache,
}

impl CacheCameraObserver {
    pub fn new(cache: &VolumeTileCache) -> Self {
        Self { cache: cache.downgrade() }
    }
}

impl CameraObserver for CacheCameraObserver {
    fn vantage_changed(&self, vantage: &Vantage) {
        if let Some(cache) = self.cache.upgrade() {
            cache.on_camera_changed(vantage.focus, vantage.scene_units_per_viewport_height);
        }
    }
}
