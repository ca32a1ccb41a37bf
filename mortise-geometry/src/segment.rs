use crate::{AxisAlignedBoundingBox2d, ProjectionSettings, Real};
use itertools::izip;
use nalgebra::{Matrix2, Point2, Vector2};
use numeric_literals::replace_float_literals;

/// A Lagrange line segment in the plane, parametrized over the reference interval `[-1, 1]`.
///
/// Node ordering follows the usual `Edge2`/`Edge3` convention: the two end points come first,
/// the mid-side node of a quadratic segment last.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LagrangeSegment2d<T: Real> {
    Linear([Point2<T>; 2]),
    Quadratic([Point2<T>; 3]),
}

/// The outcome of projecting a point onto a segment.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SegmentProjection<T: Real> {
    /// Reference coordinate of the minimizer of the distance over the whole parametric curve,
    /// possibly outside `[-1, 1]`.
    pub unclipped_xi: T,
    /// Reference coordinate clipped to `[-1, 1]`.
    pub xi: T,
    /// Physical location corresponding to `xi`.
    pub point: Point2<T>,
    pub converged: bool,
    pub iterations: usize,
}

impl<T: Real> SegmentProjection<T> {
    /// Whether the unclipped projection lies within the reference interval grown by `tolerance`.
    pub fn is_within(&self, tolerance: T) -> bool {
        self.unclipped_xi.abs() <= T::one() + tolerance
    }
}

/// Evaluate the Lagrange basis of a segment with `num_nodes` nodes at `xi`.
///
/// # Panics
///
/// Panics if `basis` does not have length `num_nodes` or if `num_nodes` is not 2 or 3.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn populate_segment_basis<T: Real>(basis: &mut [T], xi: T) {
    assert!(matches!(basis.len(), 2 | 3), "segments have 2 or 3 nodes");
    match basis.len() {
        2 => {
            basis[0] = 0.5 * (1.0 - xi);
            basis[1] = 0.5 * (1.0 + xi);
        }
        _ => {
            basis[0] = 0.5 * xi * (xi - 1.0);
            basis[1] = 0.5 * xi * (xi + 1.0);
            basis[2] = 1.0 - xi * xi;
        }
    }
}

/// Evaluate the derivatives of the Lagrange basis of a segment with respect to `xi`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn populate_segment_basis_derivatives<T: Real>(derivatives: &mut [T], xi: T) {
    assert!(matches!(derivatives.len(), 2 | 3), "segments have 2 or 3 nodes");
    match derivatives.len() {
        2 => {
            derivatives[0] = -0.5;
            derivatives[1] = 0.5;
        }
        _ => {
            derivatives[0] = xi - 0.5;
            derivatives[1] = xi + 0.5;
            derivatives[2] = -2.0 * xi;
        }
    }
}

impl<T: Real> LagrangeSegment2d<T> {
    /// Construct a segment from its nodes.
    ///
    /// Returns `None` unless exactly two or three nodes are given.
    pub fn from_nodes(nodes: &[Point2<T>]) -> Option<Self> {
        match nodes {
            [a, b] => Some(Self::Linear([*a, *b])),
            [a, b, c] => Some(Self::Quadratic([*a, *b, *c])),
            _ => None,
        }
    }

    pub fn nodes(&self) -> &[Point2<T>] {
        match self {
            Self::Linear(nodes) => nodes,
            Self::Quadratic(nodes) => nodes,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    pub fn start(&self) -> &Point2<T> {
        &self.nodes()[0]
    }

    pub fn end(&self) -> &Point2<T> {
        &self.nodes()[1]
    }

    pub fn populate_basis(&self, basis: &mut [T], xi: T) {
        populate_segment_basis(basis, xi)
    }

    /// Maps a reference coordinate to physical space.
    pub fn map_reference_coords(&self, xi: T) -> Point2<T> {
        let mut basis = [T::zero(); 3];
        let basis = &mut basis[..self.num_nodes()];
        populate_segment_basis(basis, xi);
        let mut x = Vector2::zeros();
        for (n, node) in izip!(basis.iter(), self.nodes()) {
            x += node.coords * *n;
        }
        Point2::from(x)
    }

    /// The tangent `dx/dxi` at the given reference coordinate. Not normalized.
    pub fn tangent(&self, xi: T) -> Vector2<T> {
        let mut derivatives = [T::zero(); 3];
        let derivatives = &mut derivatives[..self.num_nodes()];
        populate_segment_basis_derivatives(derivatives, xi);
        let mut t = Vector2::zeros();
        for (dn, node) in izip!(derivatives.iter(), self.nodes()) {
            t += node.coords * *dn;
        }
        t
    }

    /// Second derivative `d^2 x / dxi^2`, which vanishes for linear segments.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn curvature_vector(&self) -> Vector2<T> {
        match self {
            Self::Linear(_) => Vector2::zeros(),
            Self::Quadratic([a, b, c]) => a.coords + b.coords - c.coords * 2.0,
        }
    }

    /// A vector normal to the segment, pointing to the right of the direction of travel
    /// (outwards for a counter-clockwise element boundary). Not normalized.
    pub fn normal_dir(&self, xi: T) -> Vector2<T> {
        let t = self.tangent(xi);
        Vector2::new(t.y, -t.x)
    }

    /// The unit normal at `xi`, see [`normal_dir`](Self::normal_dir).
    pub fn unit_normal(&self, xi: T) -> Vector2<T> {
        self.normal_dir(xi).normalize()
    }

    /// The Jacobian determinant `|dx/dxi|` of the mapping from the reference interval.
    pub fn jacobian_determinant(&self, xi: T) -> T {
        self.tangent(xi).norm()
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn length(&self) -> T {
        match self {
            Self::Linear([a, b]) => (b - a).norm(),
            Self::Quadratic(_) => {
                // Three-point Gauss rule
                let x = (3.0 / 5.0).sqrt();
                let w = [5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0];
                let p = [-x, 0.0, x];
                izip!(w, p)
                    .map(|(w, xi)| w * self.jacobian_determinant(xi))
                    .fold(T::zero(), |acc, v| acc + v)
            }
        }
    }

    pub fn bounding_box(&self) -> AxisAlignedBoundingBox2d<T> {
        AxisAlignedBoundingBox2d::from_points(self.nodes()).expect("segments are never empty")
    }

    /// Projects a point onto the segment by Newton iteration on the squared distance.
    ///
    /// The iteration is capped at `settings.max_iterations`. If the cap is reached, the last
    /// iterate is returned with `converged == false`: callers treat the result as a best effort.
    /// For linear segments a single iteration is exact.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn project_point(&self, point: &Point2<T>, settings: &ProjectionSettings) -> SegmentProjection<T> {
        let tol = T::from_f64(settings.tolerance).unwrap();
        let second = self.curvature_vector();
        let mut xi = 0.0;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < settings.max_iterations {
            iterations += 1;
            let r = self.map_reference_coords(xi) - point;
            let t = self.tangent(xi);
            let gradient = t.dot(&r);
            let mut hessian = t.dot(&t) + second.dot(&r);
            if hessian <= 0.0 {
                // Fall back to a Gauss-Newton step when the curvature term makes the
                // local model non-convex
                hessian = t.dot(&t);
            }
            if hessian == 0.0 {
                // Degenerate segment: all reference coordinates map to the same point
                converged = true;
                break;
            }
            let delta = gradient / hessian;
            xi -= delta;
            if delta.abs() <= tol || self.is_linear() {
                converged = true;
                break;
            }
        }

        let clipped = xi.clamp(-1.0, 1.0);
        SegmentProjection {
            unclipped_xi: xi,
            xi: clipped,
            point: self.map_reference_coords(clipped),
            converged,
            iterations,
        }
    }

    /// Intersects the line `origin + s * direction` with the chord through the end points
    /// of the segment and returns the reference coordinate of the intersection.
    ///
    /// Returns `None` if the line is parallel to the chord.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn intersect_line_reference_coords(&self, origin: &Point2<T>, direction: &Vector2<T>) -> Option<T> {
        let a = self.start();
        let b = self.end();
        let d = b - a;
        // Solve a + t * d = origin + s * direction for (t, s)
        let matrix = Matrix2::new(d.x, -direction.x, d.y, -direction.y);
        let rhs = origin - a;
        let det = matrix.determinant();
        let scale = d.norm() * direction.norm();
        if scale == 0.0 || det.abs() <= 1e-14 * scale {
            return None;
        }
        let solution = matrix.try_inverse()? * rhs;
        Some(2.0 * solution.x - 1.0)
    }
}
