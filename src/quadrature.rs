//! Quadrature rules for line segments and the two-dimensional reference elements.
use crate::element::ElementType;
use crate::Real;
use itertools::iproduct;
use nalgebra::Point2;
use numeric_literals::replace_float_literals;

/// Weights and points of a quadrature rule.
pub type QuadraturePair<T, P> = (Vec<T>, Vec<P>);
pub type QuadraturePair1d<T> = QuadraturePair<T, T>;
pub type QuadraturePair2d<T> = QuadraturePair<T, Point2<T>>;

/// Gauss-Legendre rule on `[-1, 1]` with the given number of points.
///
/// The rule with `n` points integrates polynomials of degree `2n - 1` exactly.
///
/// # Panics
///
/// Panics unless `1 <= num_points <= 5`.
pub fn gauss<T: Real>(num_points: usize) -> QuadraturePair1d<T> {
    let (weights, points): (Vec<f64>, Vec<f64>) = match num_points {
        1 => (vec![2.0], vec![0.0]),
        2 => {
            let x = 1.0 / 3.0f64.sqrt();
            (vec![1.0, 1.0], vec![-x, x])
        }
        3 => {
            let x = (3.0f64 / 5.0).sqrt();
            (vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0], vec![-x, 0.0, x])
        }
        4 => {
            let a = (3.0 / 7.0 - 2.0 / 7.0 * (6.0f64 / 5.0).sqrt()).sqrt();
            let b = (3.0 / 7.0 + 2.0 / 7.0 * (6.0f64 / 5.0).sqrt()).sqrt();
            let wa = (18.0 + 30.0f64.sqrt()) / 36.0;
            let wb = (18.0 - 30.0f64.sqrt()) / 36.0;
            (vec![wb, wa, wa, wb], vec![-b, -a, a, b])
        }
        5 => {
            let a = 1.0 / 3.0 * (5.0 - 2.0 * (10.0f64 / 7.0).sqrt()).sqrt();
            let b = 1.0 / 3.0 * (5.0 + 2.0 * (10.0f64 / 7.0).sqrt()).sqrt();
            let wa = (322.0 + 13.0 * 70.0f64.sqrt()) / 900.0;
            let wb = (322.0 - 13.0 * 70.0f64.sqrt()) / 900.0;
            (vec![wb, wa, 128.0 / 225.0, wa, wb], vec![-b, -a, 0.0, a, b])
        }
        _ => panic!("Gauss rules are available for 1 to 5 points, {num_points} requested"),
    };
    let convert = |values: Vec<f64>| -> Vec<T> { values.into_iter().map(|v| T::from_f64(v).unwrap()).collect() };
    (convert(weights), convert(points))
}

/// Tensor-product Gauss rule on `[-1, 1]^2`.
pub fn quad_gauss<T: Real>(points_per_dim: usize) -> QuadraturePair2d<T> {
    let (w, p) = gauss::<T>(points_per_dim);
    iproduct!(0..w.len(), 0..w.len())
        .map(|(j, i)| (w[i] * w[j], Point2::new(p[i], p[j])))
        .unzip()
}

/// Symmetric rules on the unit triangle.
///
/// Strength 1 uses the centroid, strength 2 three interior points and strengths 3 and 4 the
/// six-point rule of Dunavant.
///
/// # Panics
///
/// Panics if the strength exceeds 4.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn triangle_rule<T: Real>(strength: usize) -> QuadraturePair2d<T> {
    match strength {
        0 | 1 => (vec![0.5], vec![Point2::new(1.0 / 3.0, 1.0 / 3.0)]),
        2 => {
            let w = 1.0 / 6.0;
            let points = vec![
                Point2::new(1.0 / 6.0, 1.0 / 6.0),
                Point2::new(2.0 / 3.0, 1.0 / 6.0),
                Point2::new(1.0 / 6.0, 2.0 / 3.0),
            ];
            (vec![w, w, w], points)
        }
        3 | 4 => {
            let (a, wa) = (0.445948490915965, 0.5 * 0.223381589678011);
            let (b, wb) = (0.091576213509771, 0.5 * 0.109951743655322);
            let points = vec![
                Point2::new(a, a),
                Point2::new(1.0 - 2.0 * a, a),
                Point2::new(a, 1.0 - 2.0 * a),
                Point2::new(b, b),
                Point2::new(1.0 - 2.0 * b, b),
                Point2::new(b, 1.0 - 2.0 * b),
            ];
            (vec![wa, wa, wa, wb, wb, wb], points)
        }
        _ => panic!("no triangle rule of strength {strength}"),
    }
}

/// A rule that integrates the mass matrix of the element type exactly on affine geometry.
pub fn element_quadrature<T: Real>(element_type: ElementType) -> QuadraturePair2d<T> {
    match element_type {
        ElementType::Tri3 => triangle_rule(2),
        ElementType::Tri6 => triangle_rule(4),
        ElementType::Quad4 => quad_gauss(2),
        ElementType::Quad9 => quad_gauss(3),
    }
}
