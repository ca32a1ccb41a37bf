use crate::element::side_segment;
use crate::error::{ConfigurationError, SearchError};
use crate::geometry::{LagrangeSegment2d, SegmentProjection};
use crate::mesh::{BoundaryTag, MeshQuery, SideRef};
use crate::search::{SearchSettings, SpatialProximityIndex};
use crate::Real;
use log::{debug, info};
use nalgebra::{Point2, Vector2};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mechanical state of a secondary node. Only meaningful while the node is captured.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MechanicalStatus {
    NoContact,
    Sticking,
    /// Captured without tangential resistance.
    Slipping,
    /// Captured and sliding against Coulomb friction.
    SlippingFriction,
}

impl Default for MechanicalStatus {
    fn default() -> Self {
        Self::NoContact
    }
}

/// State committed at the beginning of the current step.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContactHistory<T> {
    pub captured: bool,
    pub mechanical_status: MechanicalStatus,
    pub accumulated_slip: T,
}

/// The projection of one secondary node onto the primary surface, and its contact state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionInfo<T: Real> {
    pub secondary_node: usize,
    pub closest_side: SideRef,
    /// Global nodes of the closest side, end points first.
    pub side_nodes: Vec<usize>,
    /// Reference coordinate of the closest point on the side, in `[-1, 1]`.
    pub closest_point_local: T,
    pub closest_point_physical: Point2<T>,
    /// Outward unit normal of the primary surface at the closest point.
    pub normal: Vector2<T>,
    /// Unit tangent, the normal rotated counter-clockwise by a quarter turn.
    pub tangent: Vector2<T>,
    /// Side shape functions evaluated at the closest point.
    pub side_basis: Vec<T>,
    pub distance: T,
    /// Signed normal distance. Negative when penetrating.
    pub gap: T,
    /// Whether the projection fell within the side, up to the tangential tolerance.
    pub within_side: bool,
    pub captured: bool,
    pub mechanical_status: MechanicalStatus,
    pub accumulated_slip: T,
    /// Tangential slip since the beginning of the step.
    pub incremental_slip: T,
    /// Incremental slip as of the previous nonlinear iterate.
    pub incremental_slip_prev_iteration: T,
    pub history: ContactHistory<T>,
}

/// A state change requested by a constraint evaluator.
///
/// Evaluators never mutate [`ProjectionInfo`] directly. Requests are collected from all processors
/// and applied by the locator in node order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRequest {
    Capture,
    Release,
    SetStatus(MechanicalStatus),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateRequest {
    pub node: usize,
    pub request: StateRequest,
}

struct Candidate<T: Real> {
    side: usize,
    segment: LagrangeSegment2d<T>,
    projection: SegmentProjection<T>,
    distance: T,
}

/// Locates the projection of secondary nodes onto a primary surface.
#[derive(Debug, Clone)]
pub struct ProjectionLocator<T: Real> {
    index: SpatialProximityIndex<T>,
    primary_sides: Vec<SideRef>,
    primary_side_nodes: Vec<Vec<usize>>,
    node_sides: FxHashMap<usize, Vec<usize>>,
    infos: BTreeMap<usize, ProjectionInfo<T>>,
    step_start_positions: Option<Vec<Point2<T>>>,
    settings: SearchSettings,
}

impl<T: Real> ProjectionLocator<T> {
    pub fn build(
        mesh: &dyn MeshQuery<T>,
        constraint: &str,
        secondary: BoundaryTag,
        primary: BoundaryTag,
        settings: &SearchSettings,
    ) -> Result<Self, ConfigurationError> {
        let index = SpatialProximityIndex::build(mesh, constraint, secondary, primary, settings)?;
        let primary_sides = mesh.boundary_sides(primary).to_vec();
        let mut primary_side_nodes = Vec::with_capacity(primary_sides.len());
        let mut node_sides: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (side_idx, &side) in primary_sides.iter().enumerate() {
            let mut nodes = Vec::new();
            mesh.populate_side_nodes(side, &mut nodes);
            for &node in &nodes[..2] {
                node_sides.entry(node).or_default().push(side_idx);
            }
            primary_side_nodes.push(nodes);
        }
        Ok(Self {
            index,
            primary_sides,
            primary_side_nodes,
            node_sides,
            infos: BTreeMap::new(),
            step_start_positions: None,
            settings: settings.clone(),
        })
    }

    pub fn proximity_index(&self) -> &SpatialProximityIndex<T> {
        &self.index
    }

    /// Rebuilds the proximity patches at the next update.
    pub fn request_patch_rebuild(&mut self) {
        self.index.request_patch_rebuild();
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Refreshes the proximity index and recomputes all projections.
    pub fn update(&mut self, positions: &[Point2<T>], full_rebuild: bool) -> Result<(), SearchError> {
        self.index.refresh(positions, full_rebuild)?;
        self.detect(positions)
    }

    /// Recomputes the projection of every tracked secondary node from the current nearest-node
    /// answers of the proximity index. Contact state is preserved. Idempotent.
    pub fn detect(&mut self, positions: &[Point2<T>]) -> Result<(), SearchError> {
        if self.step_start_positions.is_none() {
            self.step_start_positions = Some(positions.to_vec());
        }
        let tolerance = T::from_f64(self.settings.tangential_tolerance).unwrap();
        let max_distance = self
            .settings
            .max_search_distance
            .map(|d| T::from_f64(d).unwrap());

        for &secondary in self.index.secondary_nodes() {
            let nearest = self
                .index
                .nearest_of(secondary)
                .ok_or(SearchError::NoCandidate {
                    secondary_node: secondary,
                })?;
            let x = positions[secondary];

            let candidates: Vec<_> = self
                .candidate_sides(nearest)
                .into_iter()
                .map(|side| {
                    let segment = side_segment(positions, &self.primary_side_nodes[side]);
                    let projection = segment.project_point(&x, &self.settings.projection);
                    if !projection.converged {
                        debug!(
                            "Projection of node {secondary} onto side {side} did not converge in {} iterations, using best effort",
                            projection.iterations
                        );
                    }
                    let distance = (x - projection.point).norm();
                    Candidate {
                        side,
                        segment,
                        projection,
                        distance,
                    }
                })
                .collect();

            let closest = |accepted_only: bool| {
                candidates
                    .iter()
                    .filter(|c| !accepted_only || c.projection.is_within(tolerance))
                    .fold(None, |best: Option<&Candidate<T>>, c| match best {
                        Some(b) if b.distance <= c.distance => Some(b),
                        _ => Some(c),
                    })
            };
            let (chosen, within_side) = match closest(true) {
                Some(c) => (c, true),
                None => (
                    closest(false).ok_or(SearchError::NoCandidate {
                        secondary_node: secondary,
                    })?,
                    false,
                ),
            };

            let captured = self
                .infos
                .get(&secondary)
                .map_or(false, |info| info.captured);
            if let Some(max_distance) = max_distance {
                if chosen.distance > max_distance && !captured {
                    self.infos.remove(&secondary);
                    continue;
                }
            }

            let xi = chosen.projection.xi;
            let normal = self.smoothed_normal(chosen, positions);
            let tangent = Vector2::new(-normal.y, normal.x);
            let point = chosen.projection.point;
            let closest_side = self.primary_sides[chosen.side];
            let side_nodes = self.primary_side_nodes[chosen.side].clone();
            let mut side_basis = vec![T::zero(); side_nodes.len()];
            chosen.segment.populate_basis(&mut side_basis, xi);

            let incremental_slip = match &self.step_start_positions {
                Some(start) => {
                    let start_point = side_segment(start, &side_nodes).map_reference_coords(xi);
                    let relative = (x - start[secondary]) - (point - start_point);
                    relative.dot(&tangent)
                }
                None => T::zero(),
            };

            let info = self
                .infos
                .entry(secondary)
                .or_insert_with(|| ProjectionInfo {
                    secondary_node: secondary,
                    closest_side,
                    side_nodes: Vec::new(),
                    closest_point_local: xi,
                    closest_point_physical: point,
                    normal,
                    tangent,
                    side_basis: Vec::new(),
                    distance: chosen.distance,
                    gap: T::zero(),
                    within_side,
                    captured: false,
                    mechanical_status: MechanicalStatus::NoContact,
                    accumulated_slip: T::zero(),
                    incremental_slip: T::zero(),
                    incremental_slip_prev_iteration: T::zero(),
                    history: ContactHistory {
                        captured: false,
                        mechanical_status: MechanicalStatus::NoContact,
                        accumulated_slip: T::zero(),
                    },
                });
            info.closest_side = closest_side;
            info.side_nodes = side_nodes;
            info.closest_point_local = xi;
            info.closest_point_physical = point;
            info.normal = normal;
            info.tangent = tangent;
            info.side_basis = side_basis;
            info.distance = chosen.distance;
            info.gap = (x - point).dot(&normal);
            info.within_side = within_side;
            info.incremental_slip = incremental_slip;
            info.accumulated_slip = info.history.accumulated_slip + incremental_slip.abs();
        }
        Ok(())
    }

    /// Primary sides attached to the nearest node, and the sides adjacent to those.
    fn candidate_sides(&self, nearest_node: usize) -> BTreeSet<usize> {
        let mut candidates = BTreeSet::new();
        if let Some(sides) = self.node_sides.get(&nearest_node) {
            for &side in sides {
                candidates.insert(side);
                for &node in &self.primary_side_nodes[side][..2] {
                    if let Some(neighbors) = self.node_sides.get(&node) {
                        candidates.extend(neighbors.iter().copied());
                    }
                }
            }
        }
        candidates
    }

    /// The side normal at the projection, blended with the neighbouring side near the side ends
    /// so that the normal varies continuously across side boundaries.
    fn smoothed_normal(&self, candidate: &Candidate<T>, positions: &[Point2<T>]) -> Vector2<T> {
        let xi = candidate.projection.xi;
        let normal = candidate.segment.unit_normal(xi);
        let smoothing = T::from_f64(self.settings.normal_smoothing_distance).unwrap();
        if smoothing <= T::zero() {
            return normal;
        }

        let one = T::one();
        let two = one + one;
        let half = one / two;
        let fraction_from_end = (one - xi.abs()) / two;
        if fraction_from_end >= smoothing {
            return normal;
        }

        let nodes = &self.primary_side_nodes[candidate.side];
        let end_node = if xi < T::zero() { nodes[0] } else { nodes[1] };
        let neighbor = self.node_sides.get(&end_node).and_then(|sides| {
            sides
                .iter()
                .copied()
                .find(|&s| s != candidate.side)
        });
        match neighbor {
            Some(neighbor) => {
                let neighbor_nodes = &self.primary_side_nodes[neighbor];
                let neighbor_xi = if neighbor_nodes[0] == end_node { -one } else { one };
                let neighbor_normal = side_segment(positions, neighbor_nodes).unit_normal(neighbor_xi);
                let weight = half * (one - fraction_from_end / smoothing);
                let blended = normal * (one - weight) + neighbor_normal * weight;
                blended
                    .try_normalize(T::default_epsilon())
                    .unwrap_or(normal)
            }
            None => normal,
        }
    }

    pub fn info(&self, secondary_node: usize) -> Option<&ProjectionInfo<T>> {
        self.infos.get(&secondary_node)
    }

    /// All tracked projections, ordered by secondary node.
    pub fn infos(&self) -> impl Iterator<Item = &ProjectionInfo<T>> {
        self.infos.values()
    }

    /// Applies state requests in node order.
    pub fn apply_requests(&mut self, requests: &[NodeStateRequest]) {
        let mut ordered = requests.to_vec();
        ordered.sort_by_key(|r| r.node);
        for NodeStateRequest { node, request } in ordered {
            let Some(info) = self.infos.get_mut(&node) else {
                continue;
            };
            match request {
                StateRequest::Capture => {
                    if !info.captured {
                        info!("Node {node} captured (gap {:?})", info.gap);
                    }
                    info.captured = true;
                }
                StateRequest::Release => {
                    if info.captured {
                        info!("Node {node} released (gap {:?})", info.gap);
                    }
                    info.captured = false;
                    info.mechanical_status = MechanicalStatus::NoContact;
                }
                StateRequest::SetStatus(status) => info.mechanical_status = status,
            }
        }
    }

    /// Shifts the incremental slip of the previous iterate. Called once per nonlinear iterate.
    pub fn advance_iteration(&mut self) {
        for info in self.infos.values_mut() {
            info.incremental_slip_prev_iteration = info.incremental_slip;
        }
    }

    /// Commits or restores contact history at the beginning of a step.
    ///
    /// If the previous step converged, the current state becomes the new history and
    /// `positions` become the reference for incremental slip. Otherwise, the state is rolled back
    /// to the history of the failed step.
    pub fn begin_step(&mut self, previous_step_converged: bool, positions: &[Point2<T>]) {
        for info in self.infos.values_mut() {
            if previous_step_converged {
                info.history = ContactHistory {
                    captured: info.captured,
                    mechanical_status: info.mechanical_status,
                    accumulated_slip: info.accumulated_slip,
                };
            } else {
                info.captured = info.history.captured;
                info.mechanical_status = info.history.mechanical_status;
                info.accumulated_slip = info.history.accumulated_slip;
            }
            info.incremental_slip = T::zero();
            info.incremental_slip_prev_iteration = T::zero();
        }
        if previous_step_converged || self.step_start_positions.is_none() {
            self.step_start_positions = Some(positions.to_vec());
        }
    }

    /// Replaces the tracked projections and the reference positions of incremental slip, e.g.
    /// when restarting from a checkpoint.
    pub fn restore(
        &mut self,
        infos: impl IntoIterator<Item = ProjectionInfo<T>>,
        step_start_positions: Option<Vec<Point2<T>>>,
    ) {
        self.infos = infos
            .into_iter()
            .map(|info| (info.secondary_node, info))
            .collect();
        self.step_start_positions = step_start_positions;
    }

    /// Node positions at the beginning of the current step, if a step has begun.
    pub fn step_start_positions(&self) -> Option<&[Point2<T>]> {
        self.step_start_positions.as_deref()
    }

    /// The position of a material point of the primary surface at the beginning of the step.
    pub fn step_start_point(&self, side_nodes: &[usize], xi: T) -> Option<Point2<T>> {
        let start = self.step_start_positions.as_ref()?;
        Some(side_segment(start, side_nodes).map_reference_coords(xi))
    }

    pub fn step_start_position(&self, node: usize) -> Option<Point2<T>> {
        Some(self.step_start_positions.as_ref()?[node])
    }
}
