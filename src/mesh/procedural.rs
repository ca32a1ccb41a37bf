//! Procedural generation of tagged meshes.
use crate::element::ElementType;
use crate::mesh::{BoundaryTag, Element, Mesh, MeshQuery, SideRef, SubdomainTag};
use crate::Real;
use nalgebra::{Point2, Vector2};

/// Side set tags attached to the four sides of a generated rectangle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RectangleTags {
    pub bottom: BoundaryTag,
    pub right: BoundaryTag,
    pub top: BoundaryTag,
    pub left: BoundaryTag,
}

impl RectangleTags {
    /// Tags `offset`, `offset + 1`, `offset + 2` and `offset + 3` for bottom, right, top and left.
    pub fn consecutive(offset: u32) -> Self {
        Self {
            bottom: BoundaryTag(offset),
            right: BoundaryTag(offset + 1),
            top: BoundaryTag(offset + 2),
            left: BoundaryTag(offset + 3),
        }
    }
}

/// Generates a uniform, axis-aligned rectangle of Quad4 elements.
///
/// `origin` is the bottom-left corner. Nodes are numbered row by row from the bottom. Every element
/// belongs to `subdomain`, and the four sides of the rectangle are collected into side sets.
///
/// # Panics
///
/// Panics if either cell count is zero.
pub fn create_rectangular_quad_mesh<T: Real>(
    origin: &Point2<T>,
    extents: &Vector2<T>,
    cells: [usize; 2],
    subdomain: SubdomainTag,
    tags: RectangleTags,
) -> Mesh<T> {
    let [nx, ny] = cells;
    assert!(nx > 0 && ny > 0, "rectangle needs at least one cell in each direction");
    let dx = extents.x / T::from_usize(nx).unwrap();
    let dy = extents.y / T::from_usize(ny).unwrap();
    let vertex_index = |i: usize, j: usize| j * (nx + 1) + i;

    let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
    for j in 0..=ny {
        for i in 0..=nx {
            let offset = Vector2::new(dx * T::from_usize(i).unwrap(), dy * T::from_usize(j).unwrap());
            vertices.push(origin + offset);
        }
    }

    let mut elements = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            elements.push(Element {
                element_type: ElementType::Quad4,
                nodes: vec![
                    vertex_index(i, j),
                    vertex_index(i + 1, j),
                    vertex_index(i + 1, j + 1),
                    vertex_index(i, j + 1),
                ],
                subdomain,
            });
        }
    }

    let element_index = |i: usize, j: usize| j * nx + i;
    let mut mesh = Mesh::from_vertices_and_elements(vertices, elements);
    mesh.add_side_set(tags.bottom, (0..nx).map(|i| SideRef::new(element_index(i, 0), 0)));
    mesh.add_side_set(tags.right, (0..ny).map(|j| SideRef::new(element_index(nx - 1, j), 1)));
    mesh.add_side_set(tags.top, (0..nx).map(|i| SideRef::new(element_index(i, ny - 1), 2)));
    mesh.add_side_set(tags.left, (0..ny).map(|j| SideRef::new(element_index(0, j), 3)));
    mesh
}

/// Splits every Quad4 element of a generated mesh into two Tri3 elements.
///
/// Side sets are carried over to the corresponding triangle sides.
pub fn split_quads_into_triangles<T: Real>(mesh: &Mesh<T>) -> Mesh<T> {
    // Quad (a, b, c, d) becomes (a, b, c) and (a, c, d).
    // Quad side -> (triangle offset, triangle side)
    const SIDE_MAP: [(usize, usize); 4] = [(0, 0), (0, 1), (1, 1), (1, 2)];
    let mut elements = Vec::new();
    for element in mesh.elements() {
        assert_eq!(element.element_type, ElementType::Quad4, "only Quad4 meshes can be split");
        let n = &element.nodes;
        elements.push(Element {
            element_type: ElementType::Tri3,
            nodes: vec![n[0], n[1], n[2]],
            subdomain: element.subdomain,
        });
        elements.push(Element {
            element_type: ElementType::Tri3,
            nodes: vec![n[0], n[2], n[3]],
            subdomain: element.subdomain,
        });
    }
    let mut result = Mesh::from_vertices_and_elements(mesh.vertices().to_vec(), elements);
    for tag in mesh.side_set_tags() {
        let sides = mesh
            .boundary_sides(tag)
            .iter()
            .map(|side| {
                let (offset, local_side) = SIDE_MAP[side.local_side];
                SideRef::new(2 * side.element + offset, local_side)
            })
            .collect::<Vec<_>>();
        result.add_side_set(tag, sides);
    }
    result
}
