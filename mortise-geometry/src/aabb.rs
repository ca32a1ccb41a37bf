use crate::Real;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in the plane.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisAlignedBoundingBox2d<T: Real> {
    min: Vector2<T>,
    max: Vector2<T>,
}

impl<T: Real> AxisAlignedBoundingBox2d<T> {
    pub fn new(min: Vector2<T>, max: Vector2<T>) -> Self {
        assert!(min.x <= max.x && min.y <= max.y, "min must not exceed max");
        Self { min, max }
    }

    pub fn min(&self) -> &Vector2<T> {
        &self.min
    }

    pub fn max(&self) -> &Vector2<T> {
        &self.max
    }

    /// Computes the minimal bounding box which encloses both `self` and `other`.
    pub fn enclose(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point2<T>>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let initial = Self::new(first.coords, first.coords);
        Some(points.fold(initial, |aabb, p| aabb.enclose(&Self::new(p.coords, p.coords))))
    }

    pub fn extents(&self) -> Vector2<T> {
        self.max - self.min
    }

    pub fn max_extent(&self) -> T {
        self.extents().amax()
    }

    pub fn center(&self) -> Point2<T> {
        Point2::from((self.max + self.min) / (T::one() + T::one()))
    }

    /// Grows the bounding box by `distance` in all directions.
    pub fn grow_uniformly(&self, distance: T) -> Self {
        let offset = Vector2::repeat(distance);
        Self::new(self.min - offset, self.max + offset)
    }

    pub fn contains_point(&self, point: &Point2<T>) -> bool {
        (0..2).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }

    pub fn intersects(&self, other: &Self) -> bool {
        (0..2).all(|i| other.min[i] <= self.max[i] && other.max[i] >= self.min[i])
    }

    /// Squared distance from the point to the closest point in the box (zero if inside).
    pub fn dist2_to(&self, point: &Point2<T>) -> T {
        let clamped = point.coords.sup(&self.min).inf(&self.max);
        (point.coords - clamped).norm_squared()
    }
}
