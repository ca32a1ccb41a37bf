use crate::block_above_square;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use mortise::mesh::{BoundaryTag, MeshQuery};
use mortise::search::{MechanicalStatus, NodeStateRequest, ProjectionLocator, SearchSettings, StateRequest};
use nalgebra::{vector, Point2};

const SQUARE_TOP: BoundaryTag = BoundaryTag(2);
const BLOCK_BOTTOM: BoundaryTag = BoundaryTag(4);

fn locator_and_positions(offset: f64) -> (ProjectionLocator<f64>, Vec<Point2<f64>>) {
    let mesh = block_above_square(offset);
    let locator =
        ProjectionLocator::build(&mesh, "contact", BLOCK_BOTTOM, SQUARE_TOP, &SearchSettings::default()).unwrap();
    (locator, mesh.vertices().to_vec())
}

#[test]
fn open_gap_is_positive_along_outward_normal() {
    let (mut locator, positions) = locator_and_positions(0.1);
    locator.update(&positions, true).unwrap();

    let infos: Vec<_> = locator.infos().collect();
    assert_eq!(infos.len(), 4);
    for info in infos {
        let x = positions[info.secondary_node];
        assert!(info.within_side);
        assert!(!info.captured);
        assert_eq!(info.mechanical_status, MechanicalStatus::NoContact);
        assert_scalar_eq!(info.gap, 0.1, comp = abs, tol = 1e-12);
        assert_scalar_eq!(info.distance, 0.1, comp = abs, tol = 1e-12);
        assert_matrix_eq!(info.normal, vector![0.0, 1.0], comp = abs, tol = 1e-12);
        assert_matrix_eq!(info.tangent, vector![-1.0, 0.0], comp = abs, tol = 1e-12);
        assert_matrix_eq!(info.closest_point_physical.coords, vector![x.x, 1.0], comp = abs, tol = 1e-12);
        assert_scalar_eq!(info.side_basis.iter().sum::<f64>(), 1.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn penetration_gives_negative_gap() {
    let (mut locator, mut positions) = locator_and_positions(0.0);
    let mesh = block_above_square(0.0);
    for node in mesh.boundary_nodes(BLOCK_BOTTOM) {
        positions[node].y -= 0.05;
    }
    locator.update(&positions, true).unwrap();
    for info in locator.infos() {
        assert_scalar_eq!(info.gap, -0.05, comp = abs, tol = 1e-12);
    }
}

#[test]
fn node_between_primary_nodes_projects_to_side_center() {
    // The square's top nodes are at x = 0, 0.5 and 1, the first block node at x = 0.25
    let (mut locator, positions) = locator_and_positions(0.0);
    locator.update(&positions, true).unwrap();
    let first = locator.infos().next().unwrap();
    assert_scalar_eq!(positions[first.secondary_node].x, 0.25, comp = abs, tol = 1e-14);
    assert_scalar_eq!(first.closest_point_local.abs(), 0.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(first.gap, 0.0, comp = abs, tol = 1e-14);
}

#[test]
fn detect_is_idempotent_and_keeps_contact_state() {
    let (mut locator, positions) = locator_and_positions(0.0);
    locator.update(&positions, true).unwrap();
    let node = locator.infos().next().unwrap().secondary_node;
    locator.apply_requests(&[
        NodeStateRequest {
            node,
            request: StateRequest::SetStatus(MechanicalStatus::Slipping),
        },
        NodeStateRequest {
            node,
            request: StateRequest::Capture,
        },
    ]);

    let before: Vec<_> = locator.infos().cloned().collect();
    locator.detect(&positions).unwrap();
    locator.detect(&positions).unwrap();
    let after: Vec<_> = locator.infos().cloned().collect();
    assert_eq!(before, after);
    assert!(locator.info(node).unwrap().captured);
    assert_eq!(locator.info(node).unwrap().mechanical_status, MechanicalStatus::Slipping);
}

#[test]
fn release_clears_mechanical_status() {
    let (mut locator, positions) = locator_and_positions(0.0);
    locator.update(&positions, true).unwrap();
    let node = locator.infos().next().unwrap().secondary_node;
    let request = |request| NodeStateRequest { node, request };
    locator.apply_requests(&[request(StateRequest::Capture), request(StateRequest::SetStatus(MechanicalStatus::Sticking))]);
    locator.apply_requests(&[request(StateRequest::Release)]);
    let info = locator.info(node).unwrap();
    assert!(!info.captured);
    assert_eq!(info.mechanical_status, MechanicalStatus::NoContact);
}

#[test]
fn incremental_slip_is_measured_from_step_start_and_rolled_back() {
    let (mut locator, mut positions) = locator_and_positions(0.0);
    locator.begin_step(true, &positions);
    locator.update(&positions, true).unwrap();
    let node = locator.infos().nth(1).unwrap().secondary_node;
    locator.apply_requests(&[NodeStateRequest {
        node,
        request: StateRequest::Capture,
    }]);
    locator.begin_step(true, &positions);

    // Slide the secondary node along the surface, against the tangent (-1, 0)
    positions[node].x += 0.01;
    locator.update(&positions, false).unwrap();
    let info = locator.info(node).unwrap();
    assert_scalar_eq!(info.incremental_slip, -0.01, comp = abs, tol = 1e-12);
    assert_scalar_eq!(info.accumulated_slip, 0.01, comp = abs, tol = 1e-12);

    // A failed step restores the committed history
    locator.begin_step(false, &positions);
    let info = locator.info(node).unwrap();
    assert!(info.captured);
    assert_scalar_eq!(info.incremental_slip, 0.0);
    assert_scalar_eq!(info.accumulated_slip, 0.0);
}

fn locator_with_settings(offset: f64, settings: &SearchSettings) -> (ProjectionLocator<f64>, Vec<Point2<f64>>) {
    let mesh = block_above_square(offset);
    let locator = ProjectionLocator::build(&mesh, "contact", BLOCK_BOTTOM, SQUARE_TOP, settings).unwrap();
    (locator, mesh.vertices().to_vec())
}

/// The secondary node with the largest x coordinate.
fn rightmost_secondary_node(positions: &[Point2<f64>]) -> usize {
    block_above_square(0.0)
        .boundary_nodes(BLOCK_BOTTOM)
        .into_iter()
        .max_by(|&a, &b| positions[a].x.total_cmp(&positions[b].x))
        .unwrap()
}

#[test]
fn tangential_tolerance_captures_nodes_just_beyond_the_surface_end() {
    // The primary sides have length 0.5, so moving 0.01 past the end gives |xi| = 1.04
    let beyond = |settings: &SearchSettings| {
        let (mut locator, mut positions) = locator_with_settings(0.0, settings);
        let node = rightmost_secondary_node(&positions);
        positions[node].x = 1.01;
        locator.update(&positions, true).unwrap();
        locator.info(node).cloned().unwrap()
    };

    let strict = beyond(&SearchSettings::default());
    assert!(!strict.within_side);
    assert_matrix_eq!(strict.closest_point_physical.coords, vector![1.0, 1.0], comp = abs, tol = 1e-12);

    let tolerant = beyond(&SearchSettings {
        tangential_tolerance: 0.05,
        ..SearchSettings::default()
    });
    assert!(tolerant.within_side);
    assert_scalar_eq!(tolerant.closest_point_local.abs(), 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(tolerant.gap, 0.0, comp = abs, tol = 1e-12);
}

#[test]
fn smoothed_normals_are_continuous_across_a_kink() {
    let smoothing = SearchSettings {
        normal_smoothing_distance: 0.5,
        ..SearchSettings::default()
    };
    let normals = |settings: &SearchSettings, secondary_x: f64| {
        let (mut locator, mut positions) = locator_with_settings(0.2, settings);
        // Raise the center of the square's top into a roof with a kink at x = 0.5
        let peak = (0..positions.len())
            .find(|&n| (positions[n] - Point2::new(0.5, 1.0)).norm() < 1e-12)
            .unwrap();
        positions[peak].y = 1.1;
        let node = rightmost_secondary_node(&positions);
        positions[node].x = secondary_x;
        locator.update(&positions, true).unwrap();
        locator.info(node).unwrap().normal
    };

    // Above the kink both sides blend to the vertical
    let at_kink = normals(&smoothing, 0.5);
    assert_matrix_eq!(at_kink, vector![0.0, 1.0], comp = abs, tol = 1e-12);

    // Near the kink the normal tilts less than the side normal; at the free end it is unchanged
    let raw = normals(&SearchSettings::default(), 0.55);
    let smoothed = normals(&smoothing, 0.55);
    assert!(raw.x > 0.0);
    assert!(smoothed.x > 0.0 && smoothed.x < raw.x);
    assert_scalar_eq!(smoothed.norm(), 1.0, comp = abs, tol = 1e-12);
    assert_matrix_eq!(normals(&smoothing, 0.95), normals(&SearchSettings::default(), 0.95), comp = abs, tol = 1e-12);
}
