use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use mortise::element::{invert_reference_map, map_reference_coords, ElementType};
use mortise::geometry::ProjectionSettings;
use mortise::mesh::procedural::{create_rectangular_quad_mesh, split_quads_into_triangles, RectangleTags};
use mortise::mesh::{BoundaryTag, MeshQuery, SubdomainTag};
use mortise::quadrature::{element_quadrature, gauss, quad_gauss, triangle_rule};
use nalgebra::{point, vector, Point2, Vector2};
use proptest::prelude::*;

const ELEMENT_TYPES: [ElementType; 4] = [ElementType::Tri3, ElementType::Quad4, ElementType::Tri6, ElementType::Quad9];

#[test]
fn gauss_rules_integrate_polynomials_exactly() {
    for n in 1..=5 {
        let (weights, points) = gauss::<f64>(n);
        assert_scalar_eq!(weights.iter().sum::<f64>(), 2.0, comp = abs, tol = 1e-14);
        // x^(2n - 2) is the highest even power integrated exactly
        let degree = 2 * n - 2;
        let integral: f64 = weights
            .iter()
            .zip(&points)
            .map(|(w, x)| w * x.powi(degree as i32))
            .sum();
        assert_scalar_eq!(integral, 2.0 / (degree as f64 + 1.0), comp = abs, tol = 1e-13);
    }
}

#[test]
fn reference_areas_are_recovered() {
    let (weights, _) = quad_gauss::<f64>(3);
    assert_scalar_eq!(weights.iter().sum::<f64>(), 4.0, comp = abs, tol = 1e-14);
    for strength in 1..=4 {
        let (weights, _) = triangle_rule::<f64>(strength);
        assert_scalar_eq!(weights.iter().sum::<f64>(), 0.5, comp = abs, tol = 1e-12);
    }
}

#[test]
fn triangle_rule_integrates_quadratics() {
    // The integral of x * y over the unit triangle is 1 / 24
    let (weights, points) = element_quadrature::<f64>(ElementType::Tri3);
    let integral: f64 = weights.iter().zip(&points).map(|(w, p)| w * p.x * p.y).sum();
    assert_scalar_eq!(integral, 1.0 / 24.0, comp = abs, tol = 1e-14);
}

#[test]
fn quad4_side_normals_point_outward() {
    let nodes = [point![0.0, 0.0], point![2.0, 0.0], point![2.0, 1.0], point![0.0, 1.0]];
    let expected = [vector![0.0, -1.0], vector![1.0, 0.0], vector![0.0, 1.0], vector![-1.0, 0.0]];
    for (side, expected) in expected.iter().enumerate() {
        let side_nodes: Vec<usize> = ElementType::Quad4.side_local_nodes(side).to_vec();
        let segment = mortise::element::side_segment(&nodes, &side_nodes);
        assert_matrix_eq!(segment.unit_normal(0.0), expected, comp = abs, tol = 1e-14);
    }
}

#[test]
fn inverse_map_of_distorted_quad() {
    let nodes = [point![0.0, 0.0], point![2.0, 0.2], point![2.5, 1.5], point![-0.2, 1.0]];
    let xi = point![0.3, -0.6];
    let x = map_reference_coords(ElementType::Quad4, &nodes, &xi);
    let recovered = invert_reference_map(ElementType::Quad4, &nodes, &x, &ProjectionSettings::default()).unwrap();
    assert_matrix_eq!(recovered.coords, xi.coords, comp = abs, tol = 1e-10);
}

#[test]
fn split_mesh_keeps_side_sets() {
    let quads = create_rectangular_quad_mesh(
        &point![0.0, 0.0],
        &vector![1.0, 1.0],
        [2, 3],
        SubdomainTag(0),
        RectangleTags::consecutive(0),
    );
    let triangles = split_quads_into_triangles(&quads);
    assert_eq!(triangles.num_elements(), 12);
    for tag in 0..4 {
        let tag = BoundaryTag(tag);
        assert_eq!(quads.boundary_nodes(tag), triangles.boundary_nodes(tag));
        assert_eq!(quads.boundary_sides(tag).len(), triangles.boundary_sides(tag).len());
    }
}

fn reference_point(element_type: ElementType) -> impl Strategy<Value = Point2<f64>> {
    let quad = element_type == ElementType::Quad4 || element_type == ElementType::Quad9;
    (-1.0..1.0, -1.0..1.0).prop_map(move |(x, y): (f64, f64)| {
        if quad {
            point![x, y]
        } else {
            // Fold the square onto the unit triangle
            let (u, v) = ((x + 1.0) / 2.0, (y + 1.0) / 2.0);
            if u + v > 1.0 {
                point![1.0 - u, 1.0 - v]
            } else {
                point![u, v]
            }
        }
    })
}

proptest! {
    #[test]
    fn basis_is_a_partition_of_unity(
        (element_type, xi) in proptest::sample::select(ELEMENT_TYPES.to_vec())
            .prop_flat_map(|t| (Just(t), reference_point(t)))
    ) {
        let n = element_type.num_nodes();
        let mut basis = vec![0.0; n];
        element_type.populate_basis(&mut basis, &xi);
        prop_assert!((basis.iter().sum::<f64>() - 1.0).abs() <= 1e-12);

        let mut gradients = vec![Vector2::zeros(); n];
        element_type.populate_basis_gradients(&mut gradients, &xi);
        let sum: Vector2<f64> = gradients.iter().sum();
        prop_assert!(sum.norm() <= 1e-12);
    }
}
