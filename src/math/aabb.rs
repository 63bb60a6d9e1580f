//! Axis-aligned bounding box in micrometer space

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from an origin corner and a size; negative sizes are normalized
    pub fn from_origin_size(origin: Vec3, size: Vec3) -> Self {
        let far = origin + size;
        Self {
            min: origin.min(far),
            max: origin.max(far),
        }
    }

    /// Get centroid
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Squared distance from `p` to the centroid
    pub fn centroid_distance_squared(&self, p: Vec3) -> f32 {
        self.center().distance_squared(p)
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Check if two AABBs intersect
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.center(), Vec3::splat(0.5));
        assert_eq!(aabb.size(), Vec3::ONE);
    }

    #[test]
    fn test_from_origin_size_normalizes() {
        let aabb = Aabb::from_origin_size(Vec3::splat(2.0), Vec3::new(-2.0, 1.0, 1.0));
        assert_eq!(aabb.min, Vec3::new(0.0, 2.0, 2.0));
        assert_eq!(aabb.max, Vec3::new(2.0, 3.0, 3.0));
    }

    #[test]
    fn test_centroid_distance() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        assert_eq!(aabb.centroid_distance_squared(Vec3::new(4.0, 1.0, 1.0)), 9.0);
    }

    #[test]
    fn test_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(!aabb.contains_point(Vec3::splat(2.0)));
    }

    #[test]
    fn test_intersects() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let c = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.merged(&c), Aabb::new(Vec3::ZERO, Vec3::splat(3.0)));
    }
}
