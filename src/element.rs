//! Two-dimensional Lagrange elements.
//!
//! Reference domains: quadrilaterals live on `[-1, 1]^2`, triangles on the unit triangle with
//! vertices `(0, 0)`, `(1, 0)` and `(0, 1)`. Local sides are oriented counter-clockwise, so the
//! right-hand normal of each side (see [`LagrangeSegment2d::normal_dir`]) points out of the element.
use crate::geometry::{LagrangeSegment2d, ProjectionSettings};
use crate::Real;
use itertools::izip;
use nalgebra::{Matrix2, Point2, Vector2};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Tri3,
    Quad4,
    Tri6,
    Quad9,
}

/// For each Quad9 node, the indices of the 1D quadratic factors in x and y.
const QUAD9_TENSOR_INDICES: [(usize, usize); 9] = [
    (0, 0),
    (1, 0),
    (1, 1),
    (0, 1),
    (2, 0),
    (1, 2),
    (2, 1),
    (0, 2),
    (2, 2),
];

const QUAD4_CORNERS: [(f64, f64); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

impl ElementType {
    pub fn num_nodes(self) -> usize {
        match self {
            Self::Tri3 => 3,
            Self::Quad4 => 4,
            Self::Tri6 => 6,
            Self::Quad9 => 9,
        }
    }

    pub fn num_sides(self) -> usize {
        match self {
            Self::Tri3 | Self::Tri6 => 3,
            Self::Quad4 | Self::Quad9 => 4,
        }
    }

    pub fn is_triangle(self) -> bool {
        matches!(self, Self::Tri3 | Self::Tri6)
    }

    /// Local node indices of the given side, end points first.
    ///
    /// # Panics
    ///
    /// Panics if the side index is out of bounds.
    pub fn side_local_nodes(self, side: usize) -> &'static [usize] {
        const TRI3: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
        const QUAD4: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
        const TRI6: [[usize; 3]; 3] = [[0, 1, 3], [1, 2, 4], [2, 0, 5]];
        const QUAD9: [[usize; 3]; 4] = [[0, 1, 4], [1, 2, 5], [2, 3, 6], [3, 0, 7]];
        assert!(side < self.num_sides(), "side index out of bounds");
        match self {
            Self::Tri3 => &TRI3[side],
            Self::Quad4 => &QUAD4[side],
            Self::Tri6 => &TRI6[side],
            Self::Quad9 => &QUAD9[side],
        }
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn reference_centroid<T: Real>(self) -> Point2<T> {
        if self.is_triangle() {
            Point2::new(1.0 / 3.0, 1.0 / 3.0)
        } else {
            Point2::origin()
        }
    }

    /// Whether the reference coordinates lie inside the reference domain grown by `tolerance`.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn contains_reference_point<T: Real>(self, xi: &Point2<T>, tolerance: T) -> bool {
        if self.is_triangle() {
            xi.x >= -tolerance && xi.y >= -tolerance && xi.x + xi.y <= 1.0 + tolerance
        } else {
            xi.x.abs() <= 1.0 + tolerance && xi.y.abs() <= 1.0 + tolerance
        }
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn populate_basis<T: Real>(self, basis: &mut [T], xi: &Point2<T>) {
        assert_eq!(basis.len(), self.num_nodes(), "basis buffer has wrong length");
        let (x, y) = (xi.x, xi.y);
        match self {
            Self::Tri3 => {
                basis[0] = 1.0 - x - y;
                basis[1] = x;
                basis[2] = y;
            }
            Self::Quad4 => {
                for (n, &(cx, cy)) in izip!(basis.iter_mut(), QUAD4_CORNERS.iter()) {
                    let (cx, cy) = (T::from_f64(cx).unwrap(), T::from_f64(cy).unwrap());
                    *n = 0.25 * (1.0 + cx * x) * (1.0 + cy * y);
                }
            }
            Self::Tri6 => {
                let l = [1.0 - x - y, x, y];
                for i in 0..3 {
                    basis[i] = l[i] * (2.0 * l[i] - 1.0);
                }
                basis[3] = 4.0 * l[0] * l[1];
                basis[4] = 4.0 * l[1] * l[2];
                basis[5] = 4.0 * l[2] * l[0];
            }
            Self::Quad9 => {
                let lx = quadratic_1d(x);
                let ly = quadratic_1d(y);
                for (n, &(i, j)) in izip!(basis.iter_mut(), QUAD9_TENSOR_INDICES.iter()) {
                    *n = lx[i] * ly[j];
                }
            }
        }
    }

    /// Gradients of the basis functions with respect to reference coordinates.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn populate_basis_gradients<T: Real>(self, gradients: &mut [Vector2<T>], xi: &Point2<T>) {
        assert_eq!(gradients.len(), self.num_nodes(), "gradient buffer has wrong length");
        let (x, y) = (xi.x, xi.y);
        match self {
            Self::Tri3 => {
                gradients[0] = Vector2::new(-1.0, -1.0);
                gradients[1] = Vector2::new(1.0, 0.0);
                gradients[2] = Vector2::new(0.0, 1.0);
            }
            Self::Quad4 => {
                for (g, &(cx, cy)) in izip!(gradients.iter_mut(), QUAD4_CORNERS.iter()) {
                    let (cx, cy) = (T::from_f64(cx).unwrap(), T::from_f64(cy).unwrap());
                    *g = Vector2::new(0.25 * cx * (1.0 + cy * y), 0.25 * cy * (1.0 + cx * x));
                }
            }
            Self::Tri6 => {
                let l = [1.0 - x - y, x, y];
                let dl = [Vector2::new(-1.0, -1.0), Vector2::new(1.0, 0.0), Vector2::new(0.0, 1.0)];
                for i in 0..3 {
                    gradients[i] = dl[i] * (4.0 * l[i] - 1.0);
                }
                let pairs = [(0, 1), (1, 2), (2, 0)];
                for (k, &(a, b)) in pairs.iter().enumerate() {
                    gradients[3 + k] = (dl[b] * l[a] + dl[a] * l[b]) * 4.0;
                }
            }
            Self::Quad9 => {
                let lx = quadratic_1d(x);
                let ly = quadratic_1d(y);
                let dlx = quadratic_1d_derivative(x);
                let dly = quadratic_1d_derivative(y);
                for (g, &(i, j)) in izip!(gradients.iter_mut(), QUAD9_TENSOR_INDICES.iter()) {
                    *g = Vector2::new(dlx[i] * ly[j], lx[i] * dly[j]);
                }
            }
        }
    }
}

/// 1D quadratic Lagrange basis on `[-1, 1]`, ordered (start, end, middle).
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn quadratic_1d<T: Real>(s: T) -> [T; 3] {
    [0.5 * s * (s - 1.0), 0.5 * s * (s + 1.0), 1.0 - s * s]
}

#[replace_float_literals(T::from_f64(literal).unwrap())]
fn quadratic_1d_derivative<T: Real>(s: T) -> [T; 3] {
    [s - 0.5, s + 0.5, -2.0 * s]
}

/// Maps reference coordinates to physical coordinates for an element with the given nodes.
pub fn map_reference_coords<T: Real>(element_type: ElementType, nodes: &[Point2<T>], xi: &Point2<T>) -> Point2<T> {
    let mut basis = vec![T::zero(); element_type.num_nodes()];
    element_type.populate_basis(&mut basis, xi);
    let x = izip!(&basis, nodes).fold(Vector2::zeros(), |acc, (n, p)| acc + p.coords * *n);
    Point2::from(x)
}

/// The Jacobian `dx/dxi` of the reference-to-physical map.
pub fn reference_jacobian<T: Real>(element_type: ElementType, nodes: &[Point2<T>], xi: &Point2<T>) -> Matrix2<T> {
    let mut gradients = vec![Vector2::zeros(); element_type.num_nodes()];
    element_type.populate_basis_gradients(&mut gradients, xi);
    izip!(&gradients, nodes).fold(Matrix2::zeros(), |acc, (g, p)| acc + p.coords * g.transpose())
}

/// Finds the reference coordinates of a physical point by Newton iteration on the element map.
///
/// Returns `None` if the Jacobian becomes singular or the iteration does not converge within
/// the iteration cap. The returned coordinates are not checked against the reference domain.
pub fn invert_reference_map<T: Real>(
    element_type: ElementType,
    nodes: &[Point2<T>],
    x: &Point2<T>,
    settings: &ProjectionSettings,
) -> Option<Point2<T>> {
    let tol = T::from_f64(settings.tolerance).unwrap();
    let mut xi = element_type.reference_centroid();
    for _ in 0..settings.max_iterations {
        let residual = map_reference_coords(element_type, nodes, &xi) - x;
        let jacobian = reference_jacobian(element_type, nodes, &xi);
        let delta = jacobian.try_inverse()? * residual;
        xi -= delta;
        if delta.norm() <= tol {
            return Some(xi);
        }
    }
    None
}

/// Builds the geometric segment of a side from node positions.
pub fn side_segment<T: Real>(positions: &[Point2<T>], side_nodes: &[usize]) -> LagrangeSegment2d<T> {
    let points: Vec<_> = side_nodes.iter().map(|&n| positions[n]).collect();
    LagrangeSegment2d::from_nodes(&points).expect("sides always have two or three nodes")
}
