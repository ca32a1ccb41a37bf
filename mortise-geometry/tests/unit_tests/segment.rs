use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use mortise_geometry::{populate_segment_basis, LagrangeSegment2d, ProjectionSettings};
use nalgebra::{point, vector, Point2};
use proptest::prelude::*;

#[test]
fn linear_segment_projection_is_exact_in_one_iteration() {
    let segment = LagrangeSegment2d::Linear([point![0.0, 1.0], point![2.0, 1.0]]);
    let projection = segment.project_point(&point![0.5, 0.0], &ProjectionSettings::default());
    assert!(projection.converged);
    assert_eq!(projection.iterations, 1);
    assert_scalar_eq!(projection.xi, -0.5, comp = abs, tol = 1e-14);
    assert_matrix_eq!(projection.point.coords, vector![0.5, 1.0], comp = abs, tol = 1e-14);
}

#[test]
fn projection_outside_segment_is_clipped() {
    let segment = LagrangeSegment2d::Linear([point![0.0, 0.0], point![1.0, 0.0]]);
    let projection = segment.project_point(&point![1.5, 1.0], &ProjectionSettings::default());
    assert_scalar_eq!(projection.unclipped_xi, 2.0, comp = abs, tol = 1e-14);
    assert_scalar_eq!(projection.xi, 1.0);
    assert!(!projection.is_within(0.5));
    assert!(projection.is_within(1.5));
    assert_matrix_eq!(projection.point.coords, vector![1.0, 0.0]);
}

#[test]
fn quadratic_segment_on_circle_projects_radially() {
    // Quadratic segment interpolating three points on the unit circle
    let h = 0.5f64.sqrt();
    let segment = LagrangeSegment2d::Quadratic([point![h, h], point![-h, h], point![0.0, 1.0]]);
    let target = point![0.0, 2.0];
    let projection = segment.project_point(&target, &ProjectionSettings::default());
    assert!(projection.converged);
    assert_scalar_eq!(projection.xi, 0.0, comp = abs, tol = 1e-12);
    assert_matrix_eq!(projection.point.coords, vector![0.0, 1.0], comp = abs, tol = 1e-12);
}

#[test]
fn capped_projection_reports_non_convergence() {
    let h = 0.5f64.sqrt();
    let segment = LagrangeSegment2d::Quadratic([point![h, h], point![-h, h], point![0.0, 1.0]]);
    let settings = ProjectionSettings {
        max_iterations: 1,
        tolerance: 0.0,
    };
    let projection = segment.project_point(&point![0.3, 3.0], &settings);
    assert!(!projection.converged);
    assert_eq!(projection.iterations, 1);
}

#[test]
fn normal_points_right_of_travel_direction() {
    // Bottom edge of a counter-clockwise unit square: outward normal is -y
    let segment = LagrangeSegment2d::Linear([point![0.0, 0.0], point![1.0, 0.0]]);
    assert_matrix_eq!(segment.unit_normal(0.0), vector![0.0, -1.0]);
    assert_scalar_eq!(segment.length(), 1.0);
    assert_scalar_eq!(segment.jacobian_determinant(0.3), 0.5);
}

#[test]
fn line_intersection_reference_coords() {
    let segment = LagrangeSegment2d::Linear([point![0.0, 1.0], point![4.0, 1.0]]);
    let xi = segment
        .intersect_line_reference_coords(&point![1.0, 0.0], &vector![0.0, 1.0])
        .unwrap();
    assert_scalar_eq!(xi, -0.5, comp = abs, tol = 1e-14);
    assert!(segment
        .intersect_line_reference_coords(&point![1.0, 0.0], &vector![1.0, 0.0])
        .is_none());
}

proptest! {
    #[test]
    fn segment_basis_is_a_partition_of_unity(xi in -1.0..=1.0f64, quadratic in any::<bool>()) {
        let mut basis = vec![0.0; if quadratic { 3 } else { 2 }];
        populate_segment_basis(&mut basis, xi);
        let sum: f64 = basis.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-14);
    }

    #[test]
    fn linear_projection_is_closest_point(x in -3.0..3.0f64, y in -3.0..3.0f64) {
        let segment = LagrangeSegment2d::Linear([point![-1.0, 0.5], point![1.0, -0.5]]);
        let p = Point2::new(x, y);
        let projection = segment.project_point(&p, &ProjectionSettings::default());
        let d = (projection.point - p).norm();
        for i in 0..=20 {
            let xi = -1.0 + 0.1 * i as f64;
            prop_assert!(d <= (segment.map_reference_coords(xi) - p).norm() + 1e-12);
        }
    }
}
