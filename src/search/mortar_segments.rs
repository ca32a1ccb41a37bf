use crate::element::side_segment;
use crate::error::ConfigurationError;
use crate::geometry::{LagrangeSegment2d, ProjectionSettings};
use crate::mesh::{BoundaryTag, MeshQuery, SideRef};
use crate::quadrature::gauss;
use crate::search::{build_box_tree, RTreeAabb};
use crate::Real;
use itertools::izip;
use log::debug;
use nalgebra::Point2;
use numeric_literals::replace_float_literals;
use std::collections::BTreeSet;

/// The overlap of one secondary side with one primary side.
///
/// The overlap is parametrized over the secondary side: it covers the reference interval
/// `[secondary_xi[0], secondary_xi[1]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MortarSegment<T: Real> {
    /// Index into [`MortarSegmentMesh::secondary_sides`].
    pub secondary_side: usize,
    /// Index into [`MortarSegmentMesh::primary_sides`].
    pub primary_side: usize,
    pub secondary_xi: [T; 2],
    pub primary_xi: [T; 2],
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MortarQuadraturePoint<T: Real> {
    /// Quadrature weight times the length element of the secondary side.
    pub weight: T,
    pub secondary_xi: T,
    pub primary_xi: T,
    pub point: Point2<T>,
}

/// The segmentation of a secondary surface by the projection of a primary surface.
#[derive(Debug, Clone)]
pub struct MortarSegmentMesh<T: Real> {
    secondary_sides: Vec<SideRef>,
    secondary_side_nodes: Vec<Vec<usize>>,
    primary_sides: Vec<SideRef>,
    primary_side_nodes: Vec<Vec<usize>>,
    segments: Vec<MortarSegment<T>>,
    projection: ProjectionSettings,
}

fn collect_side_nodes<T: Real>(
    mesh: &dyn MeshQuery<T>,
    constraint: &str,
    tag: BoundaryTag,
) -> Result<(Vec<SideRef>, Vec<Vec<usize>>), ConfigurationError> {
    let sides = mesh.boundary_sides(tag).to_vec();
    if sides.is_empty() {
        return Err(ConfigurationError::EmptyBoundary {
            constraint: constraint.to_string(),
            boundary: tag,
        });
    }
    let mut all_nodes = Vec::with_capacity(sides.len());
    for &side in &sides {
        let mut nodes = Vec::new();
        mesh.populate_side_nodes(side, &mut nodes);
        if nodes.len() != 2 {
            return Err(ConfigurationError::UnsupportedMortarSide {
                constraint: constraint.to_string(),
                nodes: nodes.len(),
            });
        }
        all_nodes.push(nodes);
    }
    Ok((sides, all_nodes))
}

impl<T: Real> MortarSegmentMesh<T> {
    pub fn build(
        mesh: &dyn MeshQuery<T>,
        constraint: &str,
        secondary: BoundaryTag,
        primary: BoundaryTag,
        projection: &ProjectionSettings,
    ) -> Result<Self, ConfigurationError> {
        let (secondary_sides, secondary_side_nodes) = collect_side_nodes(mesh, constraint, secondary)?;
        let (primary_sides, primary_side_nodes) = collect_side_nodes(mesh, constraint, primary)?;
        Ok(Self {
            secondary_sides,
            secondary_side_nodes,
            primary_sides,
            primary_side_nodes,
            segments: Vec::new(),
            projection: *projection,
        })
    }

    pub fn secondary_sides(&self) -> &[SideRef] {
        &self.secondary_sides
    }

    pub fn primary_sides(&self) -> &[SideRef] {
        &self.primary_sides
    }

    pub fn secondary_side_nodes(&self, side: usize) -> &[usize] {
        &self.secondary_side_nodes[side]
    }

    pub fn primary_side_nodes(&self, side: usize) -> &[usize] {
        &self.primary_side_nodes[side]
    }

    pub fn segments(&self) -> &[MortarSegment<T>] {
        &self.segments
    }

    /// Recomputes the segments for the given node positions.
    ///
    /// A primary side contributes to a secondary side if the two face each other and the
    /// orthogonal projection of the primary side onto the secondary side overlaps it.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn update(&mut self, positions: &[Point2<T>]) {
        let primary_segments: Vec<_> = self
            .primary_side_nodes
            .iter()
            .map(|nodes| side_segment(positions, nodes))
            .collect();
        let tree = build_box_tree(
            primary_segments
                .iter()
                .enumerate()
                .map(|(i, segment)| (i, segment.bounding_box())),
        );

        self.segments.clear();
        for (s, nodes) in self.secondary_side_nodes.iter().enumerate() {
            let secondary = side_segment(positions, nodes);
            let length = secondary.length();
            let search_box = secondary.bounding_box().grow_uniformly(0.5 * length);
            let mut candidates: Vec<usize> = tree
                .locate_in_envelope_intersecting(&RTreeAabb::envelope_of(&search_box))
                .map(|geom| geom.data)
                .collect();
            candidates.sort_unstable();

            let n_secondary = secondary.unit_normal(0.0);
            for p in candidates {
                let primary = &primary_segments[p];
                if n_secondary.dot(&primary.unit_normal(0.0)) >= 0.0 {
                    continue;
                }
                let xi_start = chord_coordinate(&secondary, primary.start());
                let xi_end = chord_coordinate(&secondary, primary.end());
                let lo = xi_start.min(xi_end).max(-1.0);
                let hi = xi_start.max(xi_end).min(1.0);
                if hi - lo <= 1e-10 {
                    continue;
                }
                let primary_xi = [lo, hi].map(|xi| self.primary_coordinate(&secondary, primary, xi));
                self.segments.push(MortarSegment {
                    secondary_side: s,
                    primary_side: p,
                    secondary_xi: [lo, hi],
                    primary_xi,
                });
            }
        }
        debug!(
            "Mortar segmentation: {} secondary sides, {} primary sides, {} segments",
            self.secondary_sides.len(),
            self.primary_sides.len(),
            self.segments.len()
        );
    }

    /// The reference coordinate on the primary side of the point hit by the secondary normal
    /// through `secondary.map(xi)`.
    fn primary_coordinate(&self, secondary: &LagrangeSegment2d<T>, primary: &LagrangeSegment2d<T>, xi: T) -> T {
        let origin = secondary.map_reference_coords(xi);
        let normal = secondary.unit_normal(xi);
        primary
            .intersect_line_reference_coords(&origin, &normal)
            .unwrap_or_else(|| primary.project_point(&origin, &self.projection).unclipped_xi)
    }

    /// Quadrature points of a segment, using a Gauss rule with `num_points` points.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn quadrature_points(
        &self,
        segment: &MortarSegment<T>,
        positions: &[Point2<T>],
        num_points: usize,
    ) -> Vec<MortarQuadraturePoint<T>> {
        let secondary = side_segment(positions, &self.secondary_side_nodes[segment.secondary_side]);
        let primary = side_segment(positions, &self.primary_side_nodes[segment.primary_side]);
        let [lo, hi] = segment.secondary_xi;
        let (weights, points) = gauss::<T>(num_points);
        izip!(weights, points)
            .map(|(w, eta)| {
                let xi = lo + 0.5 * (hi - lo) * (eta + 1.0);
                MortarQuadraturePoint {
                    weight: w * 0.5 * (hi - lo) * secondary.jacobian_determinant(xi),
                    secondary_xi: xi,
                    primary_xi: self.primary_coordinate(&secondary, &primary, xi),
                    point: secondary.map_reference_coords(xi),
                }
            })
            .collect()
    }

    /// Whether the segments of each secondary side cover it completely.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn fully_covered_secondary_sides(&self) -> Vec<bool> {
        let mut covered = vec![T::zero(); self.secondary_sides.len()];
        for segment in &self.segments {
            let [lo, hi] = segment.secondary_xi;
            covered[segment.secondary_side] += 0.5 * (hi - lo);
        }
        covered.into_iter().map(|fraction| fraction >= 1.0 - 1e-8).collect()
    }

    /// Secondary nodes that belong to at least one side covered by a segment.
    pub fn covered_secondary_nodes(&self) -> BTreeSet<usize> {
        self.segments
            .iter()
            .flat_map(|segment| self.secondary_side_nodes[segment.secondary_side].iter().copied())
            .collect()
    }
}

/// Reference coordinate on the chord of `segment` of the orthogonal projection of `point`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn chord_coordinate<T: Real>(segment: &LagrangeSegment2d<T>, point: &Point2<T>) -> T {
    let a = segment.start();
    let d = segment.end() - a;
    let t = (point - a).dot(&d) / d.norm_squared();
    2.0 * t - 1.0
}
