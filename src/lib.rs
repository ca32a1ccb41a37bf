//! Constraint enforcement and nonlinear assembly for non-conforming finite element interfaces.
//!
//! The crate assembles the global residual and Jacobian of a two-dimensional finite element
//! problem together with the contributions of interface constraints: node-face contact and tying,
//! node-element tying, nodal coupling, mortar tying and interface penalties. Constraints are
//! registered in a [`ConstraintRegistry`](registry::ConstraintRegistry), matched to the geometric
//! searches in [`search`], evaluated into local buffers and folded into the global system by the
//! [`AssemblyAccumulator`](assembly::AssemblyAccumulator). Rows owned by a constraint are replaced
//! rather than summed.
//!
//! [`ConstraintSystem`](system::ConstraintSystem) ties these pieces together and exposes the
//! residual and Jacobian entry points consumed by a nonlinear driver.
pub mod assembly;
pub mod augmented;
pub mod constraint;
pub mod dof;
pub mod element;
pub mod error;
pub mod field;
pub mod kernels;
pub mod linalg;
pub mod mesh;
pub mod parallel;
pub mod quadrature;
pub mod registry;
pub mod search;
pub mod solver;
pub mod system;

pub mod geometry {
    pub use mortise_geometry::*;
}

#[cfg(feature = "proptest")]
pub mod proptest;

pub use mortise_geometry::Real;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
