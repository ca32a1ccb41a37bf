use matrixcompare::assert_scalar_eq;
use mortise_geometry::AxisAlignedBoundingBox2d;
use nalgebra::{point, vector};

#[test]
fn aabb_from_points_encloses_all_points() {
    let points = [point![1.0, 2.0], point![-1.0, 0.5], point![3.0, -2.0]];
    let aabb = AxisAlignedBoundingBox2d::from_points(&points).unwrap();
    assert_eq!(aabb.min(), &vector![-1.0, -2.0]);
    assert_eq!(aabb.max(), &vector![3.0, 2.0]);
    assert!(points.iter().all(|p| aabb.contains_point(p)));
    assert!(AxisAlignedBoundingBox2d::<f64>::from_points(&[]).is_none());
}

#[test]
fn aabb_distance_and_intersection() {
    let aabb = AxisAlignedBoundingBox2d::new(vector![0.0, 0.0], vector![1.0, 1.0]);
    assert_scalar_eq!(aabb.dist2_to(&point![0.5, 0.5]), 0.0);
    assert_scalar_eq!(aabb.dist2_to(&point![2.0, 1.0]), 1.0, comp = float);
    assert_scalar_eq!(aabb.dist2_to(&point![-1.0, -1.0]), 2.0, comp = float);

    let other = AxisAlignedBoundingBox2d::new(vector![1.5, 0.0], vector![2.0, 1.0]);
    assert!(!aabb.intersects(&other));
    assert!(aabb.grow_uniformly(0.5).intersects(&other));
    assert_eq!(aabb.center(), point![0.5, 0.5]);
}
