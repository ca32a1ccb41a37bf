use crate::element::invert_reference_map;
use crate::error::{ConfigurationError, SearchError};
use crate::geometry::{AxisAlignedBoundingBox2d, ProjectionSettings};
use crate::mesh::{MeshQuery, SubdomainTag};
use crate::search::{build_box_tree, to_f64_point};
use crate::Real;
use nalgebra::Point2;
use std::collections::BTreeMap;

/// The primary element containing a secondary node.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementLocation<T: Real> {
    pub element: usize,
    pub xi: Point2<T>,
    pub nodes: Vec<usize>,
    /// Element shape functions evaluated at `xi`.
    pub basis: Vec<T>,
}

/// Locates the nodes of a secondary subdomain inside the elements of a primary subdomain.
#[derive(Debug, Clone)]
pub struct NodeElementLocator<T: Real> {
    secondary_nodes: Vec<usize>,
    primary_elements: Vec<usize>,
    locations: BTreeMap<usize, ElementLocation<T>>,
    settings: ProjectionSettings,
}

impl<T: Real> NodeElementLocator<T> {
    pub fn build(
        mesh: &dyn MeshQuery<T>,
        constraint: &str,
        secondary: SubdomainTag,
        primary: SubdomainTag,
        settings: &ProjectionSettings,
    ) -> Result<Self, ConfigurationError> {
        let secondary_elements = mesh.subdomain_elements(secondary);
        if secondary_elements.is_empty() {
            return Err(ConfigurationError::EmptySubdomain {
                constraint: constraint.to_string(),
                subdomain: secondary,
            });
        }
        let primary_elements = mesh.subdomain_elements(primary);
        if primary_elements.is_empty() {
            return Err(ConfigurationError::EmptySubdomain {
                constraint: constraint.to_string(),
                subdomain: primary,
            });
        }
        let mut secondary_nodes: Vec<usize> = secondary_elements
            .iter()
            .flat_map(|&e| mesh.element_nodes(e).iter().copied())
            .collect();
        secondary_nodes.sort_unstable();
        secondary_nodes.dedup();
        Ok(Self {
            secondary_nodes,
            primary_elements,
            locations: BTreeMap::new(),
            settings: *settings,
        })
    }

    pub fn secondary_nodes(&self) -> &[usize] {
        &self.secondary_nodes
    }

    /// Locates every secondary node. If a node lies in several elements, the element with the
    /// lowest index is chosen.
    pub fn update(&mut self, mesh: &dyn MeshQuery<T>, positions: &[Point2<T>]) -> Result<(), SearchError> {
        let boxes = self.primary_elements.iter().map(|&element| {
            let nodes = mesh.element_nodes(element).iter().map(|&n| &positions[n]);
            let aabb = AxisAlignedBoundingBox2d::from_points(nodes).expect("elements always have nodes");
            (element, aabb)
        });
        let tree = build_box_tree(boxes);
        let tolerance = T::from_f64(1e-10).unwrap();

        self.locations.clear();
        for &node in &self.secondary_nodes {
            let x = positions[node];
            let mut candidates: Vec<usize> = tree
                .locate_all_at_point(&to_f64_point(&x))
                .map(|geom| geom.data)
                .collect();
            candidates.sort_unstable();

            let location = candidates.into_iter().find_map(|element| {
                let element_type = mesh.element_type(element);
                let nodes = mesh.element_nodes(element);
                let coords: Vec<_> = nodes.iter().map(|&n| positions[n]).collect();
                let xi = invert_reference_map(element_type, &coords, &x, &self.settings)?;
                element_type
                    .contains_reference_point(&xi, tolerance)
                    .then(|| {
                        let mut basis = vec![T::zero(); nodes.len()];
                        element_type.populate_basis(&mut basis, &xi);
                        ElementLocation {
                            element,
                            xi,
                            nodes: nodes.to_vec(),
                            basis,
                        }
                    })
            });
            let location = location.ok_or(SearchError::NodeNotLocated { secondary_node: node })?;
            self.locations.insert(node, location);
        }
        Ok(())
    }

    pub fn location(&self, node: usize) -> Option<&ElementLocation<T>> {
        self.locations.get(&node)
    }

    pub fn locations(&self) -> impl Iterator<Item = (usize, &ElementLocation<T>)> {
        self.locations.iter().map(|(&node, location)| (node, location))
    }
}
