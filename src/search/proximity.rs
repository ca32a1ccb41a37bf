use crate::error::{ConfigurationError, SearchError};
use crate::mesh::{BoundaryTag, MeshQuery};
use crate::search::{build_point_tree, to_f64_point, PatchUpdateStrategy, SearchSettings};
use crate::Real;
use log::debug;
use nalgebra::Point2;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

/// The nearest primary node of a secondary node.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NearestNode<T> {
    pub node: usize,
    pub distance: T,
}

/// Tracks, for each node of a secondary node set, the nearest node of a primary node set.
///
/// Each secondary node scans a *patch*: the `patch_size` primary nodes closest to it at the time
/// the patch was built. When the patch is rebuilt less often than the mesh moves, the answer may
/// be approximate. [`max_patch_percentage`](Self::max_patch_percentage) reports how deep into its
/// patch the worst secondary node had to go; values close to 100 indicate undersized patches.
///
/// Ties are broken by the lowest global node index.
#[derive(Debug, Clone)]
pub struct SpatialProximityIndex<T: Real> {
    secondary_nodes: Vec<usize>,
    primary_nodes: Vec<usize>,
    slots: FxHashMap<usize, usize>,
    patches: Vec<Vec<usize>>,
    nearest: Vec<Option<NearestNode<T>>>,
    patch_size: usize,
    strategy: PatchUpdateStrategy,
    patches_built: bool,
    rebuild_requested: bool,
    max_patch_percentage: f64,
}

impl<T: Real> SpatialProximityIndex<T> {
    /// Builds the index between the nodes of two side sets.
    ///
    /// Fails if either side set has no nodes.
    pub fn build(
        mesh: &dyn MeshQuery<T>,
        constraint: &str,
        secondary: BoundaryTag,
        primary: BoundaryTag,
        settings: &SearchSettings,
    ) -> Result<Self, ConfigurationError> {
        let secondary_nodes = mesh.boundary_nodes(secondary);
        if secondary_nodes.is_empty() {
            return Err(ConfigurationError::EmptyBoundary {
                constraint: constraint.to_string(),
                boundary: secondary,
            });
        }
        let primary_nodes = mesh.boundary_nodes(primary);
        if primary_nodes.is_empty() {
            return Err(ConfigurationError::EmptyBoundary {
                constraint: constraint.to_string(),
                boundary: primary,
            });
        }
        Ok(Self::from_node_sets(secondary_nodes, primary_nodes, settings))
    }

    /// Builds the index between explicit node sets.
    ///
    /// # Panics
    ///
    /// Panics if the primary node set is empty.
    pub fn from_node_sets(mut secondary_nodes: Vec<usize>, mut primary_nodes: Vec<usize>, settings: &SearchSettings) -> Self {
        assert!(!primary_nodes.is_empty(), "primary node set must not be empty");
        secondary_nodes.sort_unstable();
        secondary_nodes.dedup();
        primary_nodes.sort_unstable();
        primary_nodes.dedup();
        let slots = secondary_nodes
            .iter()
            .enumerate()
            .map(|(slot, &node)| (node, slot))
            .collect();
        Self {
            nearest: vec![None; secondary_nodes.len()],
            patches: vec![Vec::new(); secondary_nodes.len()],
            secondary_nodes,
            primary_nodes,
            slots,
            patch_size: settings.patch_size.max(1),
            strategy: settings.patch_update_strategy,
            patches_built: false,
            rebuild_requested: false,
            max_patch_percentage: 0.0,
        }
    }

    pub fn secondary_nodes(&self) -> &[usize] {
        &self.secondary_nodes
    }

    pub fn primary_nodes(&self) -> &[usize] {
        &self.primary_nodes
    }

    /// Forces a patch rebuild on the next refresh, regardless of the update strategy.
    pub fn request_patch_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    pub fn max_patch_percentage(&self) -> f64 {
        self.max_patch_percentage
    }

    /// Re-derives the nearest primary node of every secondary node.
    ///
    /// `positions` holds the current position of every mesh node. A full rebuild recomputes the
    /// candidate patches before scanning them.
    pub fn refresh(&mut self, positions: &[Point2<T>], full_rebuild: bool) -> Result<(), SearchError> {
        let rebuild = full_rebuild
            || !self.patches_built
            || match self.strategy {
                PatchUpdateStrategy::Iteration => true,
                PatchUpdateStrategy::Auto => self.rebuild_requested,
                PatchUpdateStrategy::Never => false,
            };
        if rebuild {
            self.rebuild_patches(positions);
        }

        let mut max_percentage: f64 = 0.0;
        let mut patch_exhausted = false;
        for (slot, &secondary) in self.secondary_nodes.iter().enumerate() {
            let x = positions[secondary];
            let patch = &self.patches[slot];
            let mut best: Option<(T, usize, usize)> = None;
            for (position_in_patch, &candidate) in patch.iter().enumerate() {
                if candidate == secondary {
                    continue;
                }
                let d2 = (positions[candidate] - x).norm_squared();
                let is_better = match best {
                    None => true,
                    Some((best_d2, best_node, _)) => d2 < best_d2 || (d2 == best_d2 && candidate < best_node),
                };
                if is_better {
                    best = Some((d2, candidate, position_in_patch));
                }
            }
            let (d2, node, position_in_patch) = best.ok_or(SearchError::NoCandidate {
                secondary_node: secondary,
            })?;
            self.nearest[slot] = Some(NearestNode {
                node,
                distance: d2.sqrt(),
            });
            let percentage = 100.0 * (position_in_patch + 1) as f64 / patch.len() as f64;
            max_percentage = max_percentage.max(percentage);
            patch_exhausted |= position_in_patch + 1 == patch.len() && patch.len() < self.primary_nodes.len();
        }

        self.max_patch_percentage = max_percentage;
        self.rebuild_requested = patch_exhausted;
        debug!(
            "Proximity refresh: {} secondary nodes, {} primary nodes, patches rebuilt: {}, max patch percentage {:.1}",
            self.secondary_nodes.len(),
            self.primary_nodes.len(),
            rebuild,
            max_percentage
        );
        Ok(())
    }

    fn rebuild_patches(&mut self, positions: &[Point2<T>]) {
        let tree = build_point_tree(self.primary_nodes.iter().map(|&n| (n, positions[n])));
        let patch_size = self.patch_size;
        self.patches = self
            .secondary_nodes
            .par_iter()
            .map(|&secondary| {
                let query = to_f64_point(&positions[secondary]);
                let dist2 = |p: &[f64; 2]| (p[0] - query[0]).powi(2) + (p[1] - query[1]).powi(2);
                let mut patch: Vec<(OrderedFloat<f64>, usize)> = Vec::with_capacity(patch_size + 1);
                for candidate in tree.nearest_neighbor_iter(&query) {
                    let d2 = OrderedFloat(dist2(candidate.geom()));
                    // Also take candidates tied with the last one, so that membership does not
                    // depend on the traversal order of the tree
                    if patch.len() >= patch_size && patch.last().map_or(true, |&(last, _)| d2 > last) {
                        break;
                    }
                    patch.push((d2, candidate.data));
                }
                patch.sort_unstable();
                patch.into_iter().map(|(_, node)| node).collect()
            })
            .collect();
        self.patches_built = true;
        self.rebuild_requested = false;
    }

    pub fn nearest(&self, secondary_node: usize) -> Option<&NearestNode<T>> {
        let slot = *self.slots.get(&secondary_node)?;
        self.nearest[slot].as_ref()
    }

    /// The nearest primary node, or `None` if the node is not tracked or no refresh happened.
    pub fn nearest_of(&self, secondary_node: usize) -> Option<usize> {
        self.nearest(secondary_node).map(|n| n.node)
    }

    pub fn distance_to(&self, secondary_node: usize) -> Option<T> {
        self.nearest(secondary_node).map(|n| n.distance)
    }
}
