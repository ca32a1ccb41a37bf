//! Geometric primitives for surfaces of two-dimensional finite element meshes.
//!
//! The crate only knows about *surfaces*: boundary sides of elements, represented as
//! straight or curved Lagrange line segments, and the axis-aligned bounding boxes used to
//! prefilter candidate pairs during geometric search.
use nalgebra::RealField;

mod aabb;
mod segment;

pub use aabb::*;
pub use segment::*;

pub use nalgebra;

/// Scalar type used throughout `mortise`.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Settings for iterative closest point projection.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProjectionSettings {
    /// Hard cap on the number of Newton iterations.
    pub max_iterations: usize,
    /// Tolerance on the update of the reference coordinate.
    pub tolerance: f64,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-12,
        }
    }
}
