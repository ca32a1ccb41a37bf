use crate::element::side_segment;
use crate::error::ConfigurationError;
use crate::mesh::{InterfaceTag, MeshQuery, SideRef};
use crate::search::{build_box_tree, to_f64_point};
use crate::Real;
use ordered_float::OrderedFloat;

/// A secondary side together with the coincident primary side across an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSidePair {
    pub secondary: SideRef,
    pub secondary_nodes: Vec<usize>,
    pub primary: SideRef,
    pub primary_nodes: Vec<usize>,
}

/// One-to-one pairing of the sides of an interface, computed once in the reference configuration.
#[derive(Debug, Clone)]
pub struct InterfacePairing {
    pairs: Vec<InterfaceSidePair>,
}

impl InterfacePairing {
    /// Pairs every secondary side with the primary side whose midpoint is closest to its own.
    ///
    /// Fails if the interface is unknown, either side set is empty, or the sides do not pair up
    /// one-to-one.
    pub fn build<T: Real>(
        mesh: &dyn MeshQuery<T>,
        constraint: &str,
        interface: InterfaceTag,
    ) -> Result<Self, ConfigurationError> {
        let sides = mesh
            .interface(interface)
            .ok_or_else(|| ConfigurationError::UnknownInterface {
                constraint: constraint.to_string(),
                interface,
            })?;
        let secondary_sides = mesh.boundary_sides(sides.secondary);
        let primary_sides = mesh.boundary_sides(sides.primary);
        for (tag, side_set) in [(sides.secondary, secondary_sides), (sides.primary, primary_sides)] {
            if side_set.is_empty() {
                return Err(ConfigurationError::EmptyBoundary {
                    constraint: constraint.to_string(),
                    boundary: tag,
                });
            }
        }
        let mismatch = || ConfigurationError::MismatchedInterfacePairs {
            constraint: constraint.to_string(),
            secondary: secondary_sides.len(),
            primary: primary_sides.len(),
        };
        if secondary_sides.len() != primary_sides.len() {
            return Err(mismatch());
        }

        let positions: Vec<_> = (0..mesh.num_nodes())
            .map(|n| mesh.reference_position(n))
            .collect();
        let side_nodes = |side: SideRef| {
            let mut nodes = Vec::new();
            mesh.populate_side_nodes(side, &mut nodes);
            nodes
        };
        let primary_nodes: Vec<_> = primary_sides.iter().map(|&s| side_nodes(s)).collect();
        let primary_segments: Vec<_> = primary_nodes
            .iter()
            .map(|nodes| side_segment(&positions, nodes))
            .collect();
        let tree = build_box_tree(
            primary_segments
                .iter()
                .enumerate()
                .map(|(i, segment)| (i, segment.bounding_box())),
        );

        let half = T::from_f64(0.5).unwrap();
        let mut used = vec![false; primary_sides.len()];
        let mut pairs = Vec::with_capacity(secondary_sides.len());
        for &secondary in secondary_sides {
            let secondary_nodes = side_nodes(secondary);
            let segment = side_segment(&positions, &secondary_nodes);
            let midpoint = segment.map_reference_coords(T::zero());
            let tolerance = segment.length() * half;
            let best = tree
                .locate_all_at_point(&to_f64_point(&midpoint))
                .map(|geom| geom.data)
                .filter(|&p| !used[p])
                .map(|p| {
                    let distance = (primary_segments[p].map_reference_coords(T::zero()) - midpoint).norm();
                    (p, distance)
                })
                .filter(|&(_, distance)| distance <= tolerance)
                .min_by_key(|&(p, distance)| (OrderedFloat(distance.to_subset().unwrap_or(f64::INFINITY)), p));
            let (p, _) = best.ok_or_else(mismatch)?;
            used[p] = true;
            pairs.push(InterfaceSidePair {
                secondary,
                secondary_nodes,
                primary: primary_sides[p],
                primary_nodes: primary_nodes[p].clone(),
            });
        }
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[InterfaceSidePair] {
        &self.pairs
    }
}
