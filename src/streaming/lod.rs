//! Resolution level selection for the current zoom
//!
//! A pyramidal dataset stores each level at a different micrometers-per-voxel
//! resolution. The camera's zoom (micrometers spanned by the viewport height)
//! divided by the viewport height in pixels gives the micrometers covered by
//! one screen pixel; the best level is the coarsest one that still resolves
//! at least one voxel per pixel.

/// Micrometers covered by one screen pixel
///
/// # Examples
/// ```
/// use voltile::streaming::lod::micrometers_per_pixel;
///
/// assert_eq!(micrometers_per_pixel(1024.0, 1024), 1.0);
/// assert_eq!(micrometers_per_pixel(512.0, 1024), 0.5);
/// ```
pub fn micrometers_per_pixel(scene_units_per_viewport_height: f32, viewport_height_px: u32) -> f64 {
    scene_units_per_viewport_height as f64 / viewport_height_px.max(1) as f64
}

/// Pick the resolution level to stream for a zoom
///
/// Returns the coarsest resolution that is no coarser than one screen pixel,
/// falling back to the finest level when every level is coarser. Returns
/// `None` only when `resolutions` is empty.
///
/// # Examples
/// ```
/// use voltile::streaming::lod::select_resolution;
///
/// let levels = [0.25, 0.5, 1.0, 2.0];
/// assert_eq!(select_resolution(&levels, 1024.0, 1024), Some(1.0)); // 1 um/px
/// assert_eq!(select_resolution(&levels, 1500.0, 1024), Some(1.0)); // ~1.46 um/px
/// assert_eq!(select_resolution(&levels, 64.0, 1024), Some(0.25));  // zoomed past finest
/// assert_eq!(select_resolution(&levels, 1.0e6, 1024), Some(2.0));  // fully zoomed out
/// assert_eq!(select_resolution(&[], 1024.0, 1024), None);
/// ```
pub fn select_resolution(
    resolutions: &[f64],
    scene_units_per_viewport_height: f32,
    viewport_height_px: u32,
) -> Option<f64> {
    let finest = resolutions.iter().copied().reduce(f64::min)?;
    let per_pixel = micrometers_per_pixel(scene_units_per_viewport_height, viewport_height_px);
    if !per_pixel.is_finite() {
        return Some(finest);
    }
    let best = resolutions
        .iter()
        .copied()
        .filter(|&r| r <= per_pixel)
        .reduce(f64::max);
    Some(best.unwrap_or(finest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_always_chosen() {
        assert_eq!(select_resolution(&[3.0], 1.0, 1024), Some(3.0));
        assert_eq!(select_resolution(&[3.0], 1.0e9, 1024), Some(3.0));
    }

    #[test]
    fn test_unordered_levels() {
        let levels = [2.0, 0.5, 1.0];
        assert_eq!(select_resolution(&levels, 700.0, 1024), Some(0.5));
        assert_eq!(select_resolution(&levels, 2048.0, 1024), Some(2.0));
    }

    #[test]
    fn test_degenerate_zoom_uses_finest() {
        let levels = [0.5, 1.0];
        assert_eq!(select_resolution(&levels, f32::NAN, 1024), Some(0.5));
        assert_eq!(select_resolution(&levels, f32::INFINITY, 1024), Some(0.5));
        assert_eq!(select_resolution(&levels, 0.0, 1024), Some(0.5));
        assert_eq!(micrometers_per_pixel(10.0, 0), 10.0);
    }
}
