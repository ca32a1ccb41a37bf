//! Strategies for property-based tests.
use crate::mesh::procedural::{create_rectangular_quad_mesh, RectangleTags};
use crate::mesh::{Mesh, SubdomainTag};
use ::proptest::prelude::*;
use nalgebra::{Point2, Vector2};

pub fn point2() -> impl Strategy<Value = Point2<f64>> {
    // Keep coordinates moderate, so that distances stay well-conditioned
    let range = -10.0..10.0;
    [range.clone(), range].prop_map(|[x, y]| Point2::new(x, y))
}

/// Clouds of distinct-enough points.
pub fn point_cloud(max_points: usize) -> impl Strategy<Value = Vec<Point2<f64>>> {
    proptest::collection::vec(point2(), 1..=max_points)
}

/// Axis-aligned rectangles with between 1 and `max_cells` cells per direction, tagged with
/// [`RectangleTags::consecutive(0)`](RectangleTags::consecutive).
pub fn rectangular_mesh(max_cells: usize) -> impl Strategy<Value = Mesh<f64>> {
    let cells = 1..=max_cells;
    let extents = 0.1..10.0;
    (point2(), [extents.clone(), extents], [cells.clone(), cells]).prop_map(|(origin, [w, h], cells)| {
        create_rectangular_quad_mesh(
            &origin,
            &Vector2::new(w, h),
            cells,
            SubdomainTag(0),
            RectangleTags::consecutive(0),
        )
    })
}

/// Pairs of incremental slips `(current, trial)`, including sign reversals and zero slip.
pub fn slip_pair() -> impl Strategy<Value = (f64, f64)> {
    let slip = prop_oneof![Just(0.0), -1.0..1.0, -1e-3..1e-3];
    (slip.clone(), slip)
}
