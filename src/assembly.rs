//! Local contribution buffers, volumetric assembly and the folding of contributions into the
//! global residual and Jacobian.
use serde::{Deserialize, Serialize};

mod accumulator;
mod buffers;
mod volumetric;

pub use accumulator::*;
pub use buffers::*;
pub use volumetric::*;

/// Labels the residual piece a contribution belongs to.
///
/// An evaluation pass selects a set of tags; contributions with other tags are skipped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VectorTag {
    /// Steady-state contributions.
    NonTime,
    /// Contributions from time derivatives.
    Time,
}

impl Default for VectorTag {
    fn default() -> Self {
        Self::NonTime
    }
}

/// All vector tags.
pub const ALL_TAGS: [VectorTag; 2] = [VectorTag::NonTime, VectorTag::Time];
