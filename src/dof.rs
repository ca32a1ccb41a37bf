//! Variables and the global degree-of-freedom numbering.
use crate::mesh::MeshQuery;
use crate::Real;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub usize);

/// The nodes carrying degrees of freedom for a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableSupport {
    AllNodes,
    /// A subset of nodes, e.g. the secondary boundary for a Lagrange multiplier.
    Nodes(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable<T> {
    pub name: String,
    pub num_components: usize,
    /// Residual rows of this variable are multiplied by the scaling factor during assembly.
    pub scaling: T,
    pub support: VariableSupport,
}

/// Global DOF numbering.
///
/// DOFs are numbered variable by variable; within a variable node by node, and within a node
/// component by component. A DOF is owned by the processor that owns its node.
#[derive(Debug, Clone, PartialEq)]
pub struct DofMap<T> {
    variables: Vec<Variable<T>>,
    offsets: Vec<usize>,
    /// For each variable and node, the position of the node within the variable's support.
    node_slots: Vec<Vec<Option<usize>>>,
    /// For each DOF, the variable and node it belongs to.
    dof_variables: Vec<VariableId>,
    dof_nodes: Vec<usize>,
    dof_owners: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct DofMapBuilder<T> {
    variables: Vec<Variable<T>>,
}

impl<T: Real> Default for DofMapBuilder<T> {
    fn default() -> Self {
        Self { variables: Vec::new() }
    }
}

impl<T: Real> DofMapBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: impl Into<String>, num_components: usize, support: VariableSupport) -> VariableId {
        self.add_scaled_variable(name, num_components, T::one(), support)
    }

    pub fn add_scaled_variable(
        &mut self,
        name: impl Into<String>,
        num_components: usize,
        scaling: T,
        support: VariableSupport,
    ) -> VariableId {
        assert!(num_components > 0, "variables need at least one component");
        self.variables.push(Variable {
            name: name.into(),
            num_components,
            scaling,
            support,
        });
        VariableId(self.variables.len() - 1)
    }

    pub fn build(self, mesh: &dyn MeshQuery<T>) -> DofMap<T> {
        let num_nodes = mesh.num_nodes();
        let mut offsets = Vec::with_capacity(self.variables.len() + 1);
        let mut node_slots = Vec::with_capacity(self.variables.len());
        let mut dof_variables = Vec::new();
        let mut dof_nodes = Vec::new();
        let mut offset = 0;
        for (var_idx, variable) in self.variables.iter().enumerate() {
            let nodes: Vec<usize> = match &variable.support {
                VariableSupport::AllNodes => (0..num_nodes).collect(),
                VariableSupport::Nodes(nodes) => {
                    let mut nodes = nodes.clone();
                    nodes.sort_unstable();
                    nodes.dedup();
                    nodes
                }
            };
            let mut slots = vec![None; num_nodes];
            for (slot, &node) in nodes.iter().enumerate() {
                slots[node] = Some(slot);
                for _ in 0..variable.num_components {
                    dof_variables.push(VariableId(var_idx));
                    dof_nodes.push(node);
                }
            }
            offsets.push(offset);
            offset += nodes.len() * variable.num_components;
            node_slots.push(slots);
        }
        offsets.push(offset);
        let dof_owners = dof_nodes.iter().map(|&n| mesh.node_owner(n)).collect();
        DofMap {
            variables: self.variables,
            offsets,
            node_slots,
            dof_variables,
            dof_nodes,
            dof_owners,
        }
    }
}

impl<T: Real> DofMap<T> {
    pub fn num_dofs(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    pub fn variable(&self, id: VariableId) -> &Variable<T> {
        &self.variables[id.0]
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(VariableId)
    }

    pub fn variable_ids(&self) -> impl Iterator<Item = VariableId> {
        (0..self.variables.len()).map(VariableId)
    }

    pub fn num_components(&self, id: VariableId) -> usize {
        self.variables[id.0].num_components
    }

    pub fn has_node(&self, id: VariableId, node: usize) -> bool {
        self.node_slots[id.0]
            .get(node)
            .map_or(false, |slot| slot.is_some())
    }

    /// The global DOF of a (node, variable, component) triple, if the variable lives on the node.
    pub fn dof_index(&self, node: usize, id: VariableId, component: usize) -> Option<usize> {
        let variable = &self.variables[id.0];
        assert!(component < variable.num_components, "component out of bounds");
        let slot = (*self.node_slots[id.0].get(node)?)?;
        Some(self.offsets[id.0] + slot * variable.num_components + component)
    }

    /// Appends all DOFs of the variable at the node, in component order.
    pub fn extend_node_dofs(&self, node: usize, id: VariableId, dofs: &mut Vec<usize>) {
        for c in 0..self.num_components(id) {
            if let Some(dof) = self.dof_index(node, id, c) {
                dofs.push(dof);
            }
        }
    }

    /// Appends the DOFs of all variables living on the node.
    pub fn extend_all_node_dofs(&self, node: usize, dofs: &mut Vec<usize>) {
        for id in self.variable_ids() {
            self.extend_node_dofs(node, id, dofs);
        }
    }

    pub fn dof_variable(&self, dof: usize) -> VariableId {
        self.dof_variables[dof]
    }

    pub fn dof_node(&self, dof: usize) -> usize {
        self.dof_nodes[dof]
    }

    pub fn dof_owner(&self, dof: usize) -> usize {
        self.dof_owners[dof]
    }

    /// The residual scaling factor applied to rows of the DOF.
    pub fn scaling(&self, dof: usize) -> T {
        self.variables[self.dof_variables[dof].0].scaling
    }

    /// Nodes on which the variable has DOFs, in ascending order.
    pub fn support_nodes(&self, id: VariableId) -> Vec<usize> {
        self.node_slots[id.0]
            .iter()
            .enumerate()
            .filter_map(|(node, slot)| slot.map(|_| node))
            .collect()
    }
}
