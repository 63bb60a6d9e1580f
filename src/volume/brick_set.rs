//! Spatial index over the bricks of one resolution level

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::volume::brick::{BrickInfo, BrickKey};

/// Above this many bricks the distance pass runs on the rayon pool
const PARALLEL_QUERY_THRESHOLD: usize = 4096;

/// All bricks of exactly one resolution level of one dataset.
///
/// Built once when a dataset is opened and read-only afterwards, so it is
/// shared between the cache and the source as `Arc<BrickInfoSet>`.
#[derive(Debug)]
pub struct BrickInfoSet {
    resolution: f64,
    bricks: Vec<Arc<dyn BrickInfo>>,
    /// Key -> insertion index
    index: HashMap<BrickKey, usize>,
}

impl BrickInfoSet {
    /// Create an empty set for `resolution` micrometers per voxel
    pub fn new(resolution: f64) -> Self {
        Self {
            resolution,
            bricks: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Build a set from bricks that must all share `resolution`
    pub fn from_bricks(
        resolution: f64,
        bricks: impl IntoIterator<Item = Arc<dyn BrickInfo>>,
    ) -> Result<Self> {
        let mut set = Self::new(resolution);
        for brick in bricks {
            set.insert(brick)?;
        }
        Ok(set)
    }

    /// Add a brick, rejecting mismatched resolutions and duplicate keys
    pub fn insert(&mut self, brick: Arc<dyn BrickInfo>) -> Result<()> {
        if brick.resolution().to_bits() != self.resolution.to_bits() {
            return Err(Error::Configuration(format!(
                "brick {} has resolution {} but set holds {}",
                brick.key(),
                brick.resolution(),
                self.resolution
            )));
        }
        if self.index.contains_key(brick.key()) {
            return Err(Error::Configuration(format!("duplicate brick {}", brick.key())));
        }
        self.index.insert(brick.key().clone(), self.bricks.len());
        self.bricks.push(brick);
        Ok(())
    }

    /// Micrometers per voxel shared by every member
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// Bricks in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BrickInfo>> {
        self.bricks.iter()
    }

    pub fn get(&self, key: &BrickKey) -> Option<&Arc<dyn BrickInfo>> {
        self.index.get(key).map(|&i| &self.bricks[i])
    }

    pub fn contains(&self, key: &BrickKey) -> bool {
        self.index.contains_key(key)
    }

    /// Bounds of the whole level, `None` when empty
    pub fn bounding_box(&self) -> Option<Aabb> {
        self.bricks
            .iter()
            .map(|b| b.bounding_box())
            .reduce(|a, b| a.merged(&b))
    }

    /// The `n` bricks whose centroids are nearest to `point`, nearest first.
    ///
    /// Equal distances are ordered by insertion index, so the result is a
    /// pure function of `(point, n)`.
    pub fn closest(&self, point: Vec3, n: usize) -> Vec<Arc<dyn BrickInfo>> {
        if n == 0 || self.bricks.is_empty() {
            return Vec::new();
        }

        let distance = |(i, brick): (usize, &Arc<dyn BrickInfo>)| {
            (brick.bounding_box().centroid_distance_squared(point), i)
        };
        let mut ranked: Vec<(f32, usize)> = if self.bricks.len() > PARALLEL_QUERY_THRESHOLD {
            self.bricks.par_iter().enumerate().map(distance).collect()
        } else {
            self.bricks.iter().enumerate().map(distance).collect()
        };

        let by_distance = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
            a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
        };
        let n = n.min(ranked.len());
        if n < ranked.len() {
            ranked.select_nth_unstable_by(n - 1, by_distance);
            ranked.truncate(n);
        }
        ranked.sort_unstable_by(by_distance);

        ranked
            .into_iter()
            .map(|(_, i)| Arc::clone(&self.bricks[i]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UVec3;
    use crate::volume::memory::MemoryBrick;

    fn line_of_bricks(count: u32) -> BrickInfoSet {
        let bricks = (0..count).map(|x| {
            Arc::new(MemoryBrick::filled(
                format!("b{x}"),
                Vec3::new(x as f32 - 0.5, -0.5, -0.5),
                UVec3::splat(1),
                1.0,
                0,
            )) as Arc<dyn BrickInfo>
        });
        BrickInfoSet::from_bricks(1.0, bricks).unwrap()
    }

    fn paths(bricks: &[Arc<dyn BrickInfo>]) -> Vec<String> {
        bricks.iter().map(|b| b.key().path().to_string()).collect()
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let set = line_of_bricks(9);
        let closest = set.closest(Vec3::new(4.0, 0.0, 0.0), 3);
        assert_eq!(paths(&closest), vec!["b4", "b3", "b5"]);
    }

    #[test]
    fn test_closest_is_deterministic() {
        let set = line_of_bricks(9);
        // Midway between b3 and b4: ties broken by insertion order
        let p = Vec3::new(3.5, 0.0, 0.0);
        let first = paths(&set.closest(p, 4));
        let second = paths(&set.closest(p, 4));
        assert_eq!(first, second);
        assert_eq!(first, vec!["b3", "b4", "b2", "b5"]);
    }

    #[test]
    fn test_closest_edge_counts() {
        let set = line_of_bricks(3);
        assert!(set.closest(Vec3::ZERO, 0).is_empty());
        assert_eq!(set.closest(Vec3::ZERO, 10).len(), 3);
        assert!(BrickInfoSet::new(1.0).closest(Vec3::ZERO, 2).is_empty());
    }

    #[test]
    fn test_rejects_mixed_resolution() {
        let mut set = BrickInfoSet::new(1.0);
        let coarse = Arc::new(MemoryBrick::filled("c", Vec3::ZERO, UVec3::splat(1), 2.0, 0));
        assert!(matches!(set.insert(coarse), Err(Error::Configuration(_))));
        assert!(set.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_key() {
        let mut set = BrickInfoSet::new(1.0);
        let brick = Arc::new(MemoryBrick::filled("a", Vec3::ZERO, UVec3::splat(1), 1.0, 0));
        set.insert(brick.clone()).unwrap();
        assert!(set.insert(brick.clone()).is_err());
        assert!(set.contains(brick.key()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_bounding_box() {
        let set = line_of_bricks(3);
        let bounds = set.bounding_box().unwrap();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::new(2.5, 0.5, 0.5));
    }
}
