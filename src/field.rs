//! Read access to solution fields.
use crate::dof::{DofMap, VariableId};
use crate::geometry::populate_segment_basis;
use crate::mesh::MeshQuery;
use crate::Real;
use itertools::izip;
use nalgebra::{DVector, Point2, Vector2};

/// Access to the current and old values of the solution fields.
pub trait FieldAccess<T: Real> {
    fn dof_map(&self) -> &DofMap<T>;
    fn current(&self) -> &DVector<T>;
    fn old(&self) -> &DVector<T>;

    fn dof_index(&self, node: usize, variable: VariableId, component: usize) -> Option<usize> {
        self.dof_map().dof_index(node, variable, component)
    }

    /// The current nodal value, or zero if the variable does not live on the node.
    fn nodal_value(&self, node: usize, variable: VariableId, component: usize) -> T {
        self.dof_index(node, variable, component)
            .map_or(T::zero(), |dof| self.current()[dof])
    }

    fn old_nodal_value(&self, node: usize, variable: VariableId, component: usize) -> T {
        self.dof_index(node, variable, component)
            .map_or(T::zero(), |dof| self.old()[dof])
    }

    /// Interpolates the current value on a side at the given reference coordinate.
    fn interpolate_on_side(&self, side_nodes: &[usize], variable: VariableId, component: usize, xi: T) -> T {
        let mut basis = [T::zero(); 3];
        let basis = &mut basis[..side_nodes.len()];
        populate_segment_basis(basis, xi);
        izip!(basis.iter(), side_nodes)
            .map(|(n, &node)| *n * self.nodal_value(node, variable, component))
            .fold(T::zero(), |acc, v| acc + v)
    }

    /// Interpolates the current value from nodal shape function values.
    fn interpolate(&self, nodes: &[usize], basis: &[T], variable: VariableId, component: usize) -> T {
        izip!(basis, nodes)
            .map(|(n, &node)| *n * self.nodal_value(node, variable, component))
            .fold(T::zero(), |acc, v| acc + v)
    }
}

/// Borrowed solution vectors together with their DOF numbering.
#[derive(Debug, Copy, Clone)]
pub struct SolutionState<'a, T: Real> {
    dof_map: &'a DofMap<T>,
    current: &'a DVector<T>,
    old: &'a DVector<T>,
}

impl<'a, T: Real> SolutionState<'a, T> {
    pub fn new(dof_map: &'a DofMap<T>, current: &'a DVector<T>, old: &'a DVector<T>) -> Self {
        assert_eq!(current.len(), dof_map.num_dofs(), "solution does not match the DOF map");
        assert_eq!(old.len(), dof_map.num_dofs(), "old solution does not match the DOF map");
        Self { dof_map, current, old }
    }
}

impl<'a, T: Real> FieldAccess<T> for SolutionState<'a, T> {
    fn dof_map(&self) -> &DofMap<T> {
        self.dof_map
    }

    fn current(&self) -> &DVector<T> {
        self.current
    }

    fn old(&self) -> &DVector<T> {
        self.old
    }
}

/// Node positions, displaced by the given two-component displacement variable if present.
pub fn displaced_positions<T: Real>(
    mesh: &dyn MeshQuery<T>,
    dof_map: &DofMap<T>,
    solution: &DVector<T>,
    displacement: Option<VariableId>,
) -> Vec<Point2<T>> {
    (0..mesh.num_nodes())
        .map(|node| {
            let x = mesh.reference_position(node);
            match displacement {
                Some(var) if dof_map.has_node(var, node) => {
                    let ux = dof_map.dof_index(node, var, 0).map_or(T::zero(), |i| solution[i]);
                    let uy = dof_map.dof_index(node, var, 1).map_or(T::zero(), |i| solution[i]);
                    x + Vector2::new(ux, uy)
                }
                _ => x,
            }
        })
        .collect()
}
