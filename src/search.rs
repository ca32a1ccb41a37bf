//! Geometric search between secondary and primary surfaces.
use crate::geometry::AxisAlignedBoundingBox2d;
use crate::Real;
use nalgebra::Point2;
use rstar::primitives::GeomWithData;
use rstar::{Envelope, PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

mod interface;
mod mortar_segments;
mod node_element;
mod projection;
mod proximity;

pub use interface::*;
pub use mortar_segments::*;
pub use node_element::*;
pub use projection::*;
pub use proximity::*;

/// Controls how often the candidate patches of the proximity index are rebuilt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchUpdateStrategy {
    /// Rebuild when the previous refresh indicates that a patch may be too small, or on request.
    Auto,
    /// Rebuild on every refresh.
    Iteration,
    /// Build once, then only on an explicit full rebuild.
    Never,
}

/// Settings of the node-to-surface search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Number of primary candidates scanned per secondary node.
    pub patch_size: usize,
    pub patch_update_strategy: PatchUpdateStrategy,
    /// Projections whose reference coordinate lies outside `[-1, 1]` by at most this amount
    /// are still accepted.
    pub tangential_tolerance: f64,
    /// Fraction of the side length, measured from each end, over which normals are blended
    /// with the neighbouring side. Zero disables smoothing.
    pub normal_smoothing_distance: f64,
    /// Secondary nodes farther than this from the primary surface are not tracked.
    pub max_search_distance: Option<f64>,
    pub projection: crate::geometry::ProjectionSettings,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            patch_size: 20,
            patch_update_strategy: PatchUpdateStrategy::Auto,
            tangential_tolerance: 1e-6,
            normal_smoothing_distance: 0.0,
            max_search_distance: None,
            projection: Default::default(),
        }
    }
}

pub(crate) fn to_f64_point<T: Real>(point: &Point2<T>) -> [f64; 2] {
    let x = point.x.to_subset().expect("coordinates must be representable as f64");
    let y = point.y.to_subset().expect("coordinates must be representable as f64");
    [x, y]
}

pub(crate) type IndexedPoint = GeomWithData<[f64; 2], usize>;

pub(crate) fn build_point_tree<T: Real>(points: impl IntoIterator<Item = (usize, Point2<T>)>) -> RTree<IndexedPoint> {
    let geometries = points
        .into_iter()
        .map(|(index, p)| GeomWithData::new(to_f64_point(&p), index))
        .collect();
    RTree::bulk_load(geometries)
}

/// An axis-aligned box stored in an `rstar` tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RTreeAabb(pub AxisAlignedBoundingBox2d<f64>);

impl RTreeAabb {
    pub fn from_box<T: Real>(aabb: &AxisAlignedBoundingBox2d<T>) -> Self {
        let min = aabb.min().map(|x| x.to_subset().expect("coordinates must be representable as f64"));
        let max = aabb.max().map(|x| x.to_subset().expect("coordinates must be representable as f64"));
        Self(AxisAlignedBoundingBox2d::new(min, max))
    }

    pub fn envelope_of<T: Real>(aabb: &AxisAlignedBoundingBox2d<T>) -> AABB<[f64; 2]> {
        Self::from_box(aabb).envelope()
    }
}

impl RTreeObject for RTreeAabb {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        let Self(aabb) = self;
        AABB::from_corners([aabb.min().x, aabb.min().y], [aabb.max().x, aabb.max().y])
    }
}

impl PointDistance for RTreeAabb {
    fn distance_2(&self, point: &<Self::Envelope as Envelope>::Point) -> f64 {
        self.0.dist2_to(&Point2::new(point[0], point[1]))
    }

    fn contains_point(&self, point: &<Self::Envelope as Envelope>::Point) -> bool {
        self.0.contains_point(&Point2::new(point[0], point[1]))
    }
}

pub(crate) type IndexedBox = GeomWithData<RTreeAabb, usize>;

/// Builds a tree over boxes, each grown slightly to accommodate round-off.
pub(crate) fn build_box_tree<T: Real>(boxes: impl IntoIterator<Item = (usize, AxisAlignedBoundingBox2d<T>)>) -> RTree<IndexedBox> {
    let geometries = boxes
        .into_iter()
        .map(|(index, aabb)| {
            let margin = aabb.max_extent() * T::from_f64(0.01).unwrap();
            GeomWithData::new(RTreeAabb::from_box(&aabb.grow_uniformly(margin)), index)
        })
        .collect();
    RTree::bulk_load(geometries)
}
