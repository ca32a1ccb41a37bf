//! Mesh storage, tags and the query interface used by constraints and searches.
use crate::element::ElementType;
use crate::geometry::AxisAlignedBoundingBox2d;
use crate::Real;
use itertools::Itertools;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod procedural;

/// Identifies a set of boundary sides (a side set).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoundaryTag(pub u32);

/// Identifies a set of elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubdomainTag(pub u32);

/// Identifies an interface, i.e. a pair of coincident side sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceTag(pub u32);

/// A local side of an element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SideRef {
    pub element: usize,
    pub local_side: usize,
}

impl SideRef {
    pub fn new(element: usize, local_side: usize) -> Self {
        Self { element, local_side }
    }
}

/// A stable, non-owning reference to a mesh entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MeshEntityRef {
    Node(usize),
    Element(usize),
    Side(SideRef),
}

/// The secondary and primary side sets making up an interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSides {
    pub secondary: BoundaryTag,
    pub primary: BoundaryTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub element_type: ElementType,
    pub nodes: Vec<usize>,
    pub subdomain: SubdomainTag,
}

/// Read access to the mesh as needed by geometric search and constraint evaluation.
///
/// Node positions returned here are *reference* positions. Displaced geometry is obtained by
/// combining them with a displacement field, see [`crate::field::displaced_positions`].
pub trait MeshQuery<T: Real> {
    fn num_nodes(&self) -> usize;
    fn num_elements(&self) -> usize;
    fn reference_position(&self, node: usize) -> Point2<T>;
    fn element_type(&self, element: usize) -> ElementType;
    fn element_nodes(&self, element: usize) -> &[usize];
    fn element_subdomain(&self, element: usize) -> SubdomainTag;

    /// Sides belonging to the given side set, in a deterministic order.
    ///
    /// Unknown tags yield an empty slice.
    fn boundary_sides(&self, tag: BoundaryTag) -> &[SideRef];
    fn boundary_tag_by_name(&self, name: &str) -> Option<BoundaryTag>;
    fn interface(&self, tag: InterfaceTag) -> Option<InterfaceSides>;

    /// Elements adjacent to a node, sorted by element index.
    fn node_elements(&self, node: usize) -> &[usize];
    /// The processor owning the node.
    fn node_owner(&self, node: usize) -> usize;
    fn element_owner(&self, element: usize) -> usize;

    /// Global node indices of a side, end points first.
    fn populate_side_nodes(&self, side: SideRef, nodes: &mut Vec<usize>) {
        let element_nodes = self.element_nodes(side.element);
        nodes.clear();
        nodes.extend(
            self.element_type(side.element)
                .side_local_nodes(side.local_side)
                .iter()
                .map(|&i| element_nodes[i]),
        );
    }

    /// Sorted, deduplicated nodes of a side set.
    fn boundary_nodes(&self, tag: BoundaryTag) -> Vec<usize> {
        let mut buffer = Vec::new();
        let mut nodes = Vec::new();
        for &side in self.boundary_sides(tag) {
            self.populate_side_nodes(side, &mut buffer);
            nodes.extend_from_slice(&buffer);
        }
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Sorted elements of a subdomain.
    fn subdomain_elements(&self, tag: SubdomainTag) -> Vec<usize> {
        (0..self.num_elements())
            .filter(|&e| self.element_subdomain(e) == tag)
            .collect()
    }
}

/// An unstructured two-dimensional mesh with mixed element types.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh<T: Real> {
    vertices: Vec<Point2<T>>,
    elements: Vec<Element>,
    side_sets: BTreeMap<BoundaryTag, Vec<SideRef>>,
    boundary_names: BTreeMap<String, BoundaryTag>,
    interfaces: BTreeMap<InterfaceTag, InterfaceSides>,
    node_owners: Vec<usize>,
    element_owners: Vec<usize>,
    node_elements: Vec<Vec<usize>>,
}

impl<T: Real> Mesh<T> {
    /// Creates a mesh owned entirely by processor 0.
    ///
    /// # Panics
    ///
    /// Panics if an element refers to a node that does not exist, or has the wrong number of nodes.
    pub fn from_vertices_and_elements(vertices: Vec<Point2<T>>, elements: Vec<Element>) -> Self {
        for element in &elements {
            assert_eq!(
                element.nodes.len(),
                element.element_type.num_nodes(),
                "element has the wrong number of nodes for its type"
            );
            assert!(
                element.nodes.iter().all(|&n| n < vertices.len()),
                "element refers to a node out of bounds"
            );
        }
        let mut mesh = Self {
            node_owners: vec![0; vertices.len()],
            element_owners: vec![0; elements.len()],
            vertices,
            elements,
            side_sets: BTreeMap::new(),
            boundary_names: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            node_elements: Vec::new(),
        };
        mesh.rebuild_adjacency();
        mesh
    }

    fn rebuild_adjacency(&mut self) {
        let mut node_elements = vec![Vec::new(); self.vertices.len()];
        for (element_idx, element) in self.elements.iter().enumerate() {
            for &node in &element.nodes {
                node_elements[node].push(element_idx);
            }
        }
        for list in &mut node_elements {
            list.dedup();
        }
        self.node_elements = node_elements;
    }

    pub fn vertices(&self) -> &[Point2<T>] {
        &self.vertices
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Adds sides to a side set, creating it if necessary.
    pub fn add_side_set(&mut self, tag: BoundaryTag, sides: impl IntoIterator<Item = SideRef>) {
        let entry = self.side_sets.entry(tag).or_default();
        entry.extend(sides);
        entry.sort_unstable();
        entry.dedup();
    }

    pub fn set_boundary_name(&mut self, name: impl Into<String>, tag: BoundaryTag) {
        self.boundary_names.insert(name.into(), tag);
    }

    pub fn add_interface(&mut self, tag: InterfaceTag, sides: InterfaceSides) {
        self.interfaces.insert(tag, sides);
    }

    pub fn side_set_tags(&self) -> impl Iterator<Item = BoundaryTag> + '_ {
        self.side_sets.keys().copied()
    }

    /// Appends another mesh, offsetting its node and element indices.
    ///
    /// Side sets with the same tag are merged. Ownership of the appended entities is preserved.
    pub fn append(&mut self, other: &Mesh<T>) {
        let node_offset = self.vertices.len();
        let element_offset = self.elements.len();
        self.vertices.extend_from_slice(&other.vertices);
        self.elements.extend(other.elements.iter().map(|element| Element {
            element_type: element.element_type,
            nodes: element.nodes.iter().map(|n| n + node_offset).collect(),
            subdomain: element.subdomain,
        }));
        self.node_owners.extend_from_slice(&other.node_owners);
        self.element_owners.extend_from_slice(&other.element_owners);
        for (&tag, sides) in &other.side_sets {
            self.add_side_set(
                tag,
                sides
                    .iter()
                    .map(|side| SideRef::new(side.element + element_offset, side.local_side)),
            );
        }
        for (name, &tag) in &other.boundary_names {
            self.boundary_names.entry(name.clone()).or_insert(tag);
        }
        for (&tag, &sides) in &other.interfaces {
            self.interfaces.entry(tag).or_insert(sides);
        }
        self.rebuild_adjacency();
    }

    /// Distributes nodes over `num_processors` contiguous blocks of node indices.
    ///
    /// Each element is owned by the owner of its lowest-numbered node. Node and element
    /// ownership therefore need not coincide for nodes on partition boundaries.
    pub fn partition_contiguous(&mut self, num_processors: usize) {
        assert!(num_processors > 0, "need at least one processor");
        let n = self.vertices.len().max(1);
        self.node_owners = (0..self.vertices.len())
            .map(|i| (i * num_processors) / n)
            .collect();
        self.element_owners = self
            .elements
            .iter()
            .map(|element| {
                let lowest = element.nodes.iter().copied().min().unwrap_or(0);
                self.node_owners.get(lowest).copied().unwrap_or(0)
            })
            .collect();
    }

    pub fn bounding_box(&self) -> Option<AxisAlignedBoundingBox2d<T>> {
        AxisAlignedBoundingBox2d::from_points(&self.vertices)
    }

    /// Sides that belong to exactly one element.
    pub fn find_boundary_sides(&self) -> Vec<SideRef> {
        let mut buffer = Vec::new();
        let mut keyed: BTreeMap<(usize, usize), Vec<SideRef>> = BTreeMap::new();
        for element in 0..self.elements.len() {
            for local_side in 0..self.elements[element].element_type.num_sides() {
                let side = SideRef::new(element, local_side);
                self.populate_side_nodes(side, &mut buffer);
                let (a, b) = (buffer[0], buffer[1]);
                keyed.entry((a.min(b), a.max(b))).or_default().push(side);
            }
        }
        keyed
            .into_values()
            .filter(|sides| sides.len() == 1)
            .flatten()
            .sorted()
            .collect()
    }
}

impl<T: Real> MeshQuery<T> for Mesh<T> {
    fn num_nodes(&self) -> usize {
        self.vertices.len()
    }

    fn num_elements(&self) -> usize {
        self.elements.len()
    }

    fn reference_position(&self, node: usize) -> Point2<T> {
        self.vertices[node]
    }

    fn element_type(&self, element: usize) -> ElementType {
        self.elements[element].element_type
    }

    fn element_nodes(&self, element: usize) -> &[usize] {
        &self.elements[element].nodes
    }

    fn element_subdomain(&self, element: usize) -> SubdomainTag {
        self.elements[element].subdomain
    }

    fn boundary_sides(&self, tag: BoundaryTag) -> &[SideRef] {
        self.side_sets.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    fn boundary_tag_by_name(&self, name: &str) -> Option<BoundaryTag> {
        self.boundary_names.get(name).copied()
    }

    fn interface(&self, tag: InterfaceTag) -> Option<InterfaceSides> {
        self.interfaces.get(&tag).copied()
    }

    fn node_elements(&self, node: usize) -> &[usize] {
        &self.node_elements[node]
    }

    fn node_owner(&self, node: usize) -> usize {
        self.node_owners[node]
    }

    fn element_owner(&self, element: usize) -> usize {
        self.element_owners[element]
    }
}
