//! Constraints coupling a secondary surface, node set or subdomain to a primary one.
//!
//! Constraints come in five kinds, each with its own evaluation contract:
//!
//! - [`NodalConstraint`]: a secondary node coupled to its nearest primary node.
//! - [`NodeFaceConstraint`]: a secondary node coupled to its projection onto a primary surface.
//! - [`NodeElemConstraint`]: a secondary node coupled to the primary element containing it.
//! - [`MortarConstraint`]: integral coupling over mortar segments, with a Lagrange multiplier.
//! - [`ElemElemConstraint`]: integral coupling of paired interface sides.
//!
//! The kind of a constraint is fixed when it is wrapped in a [`Constraint`].
use crate::assembly::{LocalContributionBuffer, RowSet, VectorTag, ColumnSet};
use crate::dof::{DofMap, VariableId};
use crate::error::{ConfigurationError, EvaluationError};
use crate::field::FieldAccess;
use crate::linalg::GlobalMatrix;
use crate::mesh::{BoundaryTag, InterfaceTag, MeshQuery, SubdomainTag};
use crate::search::{
    ElementLocation, InterfaceSidePair, MortarQuadraturePoint, NearestNode, ProjectionInfo, SearchSettings,
    StateRequest,
};
use crate::Real;
use nalgebra::{DVector, Point2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Debug, Formatter};

mod contact;
mod elem_elem;
mod friction;
mod mortar;
mod nodal;
mod node_elem;
mod thermal;
mod tied;

pub use contact::*;
pub use elem_elem::*;
pub use friction::*;
pub use mortar::*;
pub use nodal::*;
pub use node_elem::*;
pub use thermal::*;
pub use tied::*;

/// The kind of a constraint. Kinds are evaluated in the order of this enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConstraintKind {
    Nodal,
    NodeFace,
    NodeElem,
    Mortar,
    ElemElem,
}

/// The pair of mesh regions a constraint is registered under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InteractionKey {
    BoundaryPair { secondary: BoundaryTag, primary: BoundaryTag },
    SubdomainPair { secondary: SubdomainTag, primary: SubdomainTag },
    Interface(InterfaceTag),
}

/// A time interval outside of which a constraint is inactive.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationWindow<T> {
    pub start: Option<T>,
    pub end: Option<T>,
    pub enabled: bool,
}

impl<T> Default for ActivationWindow<T> {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            enabled: true,
        }
    }
}

impl<T: Real> ActivationWindow<T> {
    pub fn is_active(&self, time: T) -> bool {
        self.enabled && self.start.map_or(true, |start| time >= start) && self.end.map_or(true, |end| time <= end)
    }
}

/// Data shared by constraints of all kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintBase<T> {
    pub name: String,
    pub key: InteractionKey,
    /// Whether geometric search uses the displaced rather than the reference configuration.
    pub use_displaced_mesh: bool,
    /// The constrained variable.
    pub variable: VariableId,
    /// Variables for which off-diagonal Jacobian blocks are computed.
    pub coupled_variables: Vec<VariableId>,
    pub vector_tag: VectorTag,
    pub activation: ActivationWindow<T>,
}

impl<T: Real> ConstraintBase<T> {
    pub fn new(name: impl Into<String>, key: InteractionKey, variable: VariableId) -> Self {
        Self {
            name: name.into(),
            key,
            use_displaced_mesh: false,
            variable,
            coupled_variables: Vec::new(),
            vector_tag: VectorTag::NonTime,
            activation: ActivationWindow::default(),
        }
    }

    pub fn displaced(self, use_displaced_mesh: bool) -> Self {
        Self {
            use_displaced_mesh,
            ..self
        }
    }

    pub fn with_coupled_variables(self, coupled_variables: Vec<VariableId>) -> Self {
        Self {
            coupled_variables,
            ..self
        }
    }

    pub fn active_between(self, start: Option<T>, end: Option<T>) -> Self {
        Self {
            activation: ActivationWindow {
                start,
                end,
                enabled: true,
            },
            ..self
        }
    }

    /// Checks that the constrained variable exists and has the expected number of components.
    pub fn check_variable(&self, dof_map: &DofMap<T>, num_components: Option<usize>) -> Result<(), ConfigurationError> {
        let missing = |variable: VariableId| ConfigurationError::MissingVariable {
            constraint: self.name.clone(),
            variable: format!("#{}", variable.0),
        };
        let variable = dof_map
            .variable_ids()
            .find(|&id| id == self.variable)
            .ok_or_else(|| missing(self.variable))?;
        if let Some(n) = num_components {
            if dof_map.num_components(variable) != n {
                return Err(ConfigurationError::MissingVariable {
                    constraint: self.name.clone(),
                    variable: dof_map.variable(variable).name.clone(),
                });
            }
        }
        for &coupled in &self.coupled_variables {
            if !dof_map.variable_ids().any(|id| id == coupled) {
                return Err(missing(coupled));
            }
        }
        Ok(())
    }
}

/// The outcome of the active-set query for one secondary entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyDecision {
    pub apply: bool,
    /// Contact state changes to be applied by the owning search before evaluation.
    pub requests: Vec<StateRequest>,
}

impl ApplyDecision {
    pub fn apply() -> Self {
        Self {
            apply: true,
            requests: Vec::new(),
        }
    }

    pub fn skip() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, request: StateRequest) -> Self {
        self.requests.push(request);
        self
    }
}

/// Read-only view of the system state during constraint evaluation.
pub struct EvaluationContext<'a, T: Real> {
    pub mesh: &'a dyn MeshQuery<T>,
    pub field: &'a dyn FieldAccess<T>,
    /// Node positions in the configuration used by the constraint's geometric search.
    pub positions: &'a [Point2<T>],
    /// The closed residual of all non-constraint contributions of the current pass.
    ///
    /// While active sets are determined, before the current pass is assembled, this is the
    /// residual of the previous pass.
    pub physics_residual: &'a DVector<T>,
    /// The closed non-constraint Jacobian, available during Jacobian passes.
    pub physics_jacobian: Option<&'a GlobalMatrix<T>>,
    pub time: T,
    pub dt: T,
}

impl<'a, T: Real> Debug for EvaluationContext<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("time", &self.time)
            .field("dt", &self.dt)
            .field("has_jacobian", &self.physics_jacobian.is_some())
            .finish()
    }
}

impl<'a, T: Real> EvaluationContext<'a, T> {
    pub fn dof_map(&self) -> &DofMap<T> {
        self.field.dof_map()
    }

    /// The DOFs of a variable on a list of nodes, node by node.
    pub fn nodes_dofs(&self, nodes: &[usize], variable: VariableId) -> Vec<usize> {
        let mut dofs = Vec::new();
        for &node in nodes {
            self.dof_map().extend_node_dofs(node, variable, &mut dofs);
        }
        dofs
    }

    /// All DOFs of all nodes of the elements sharing `node`, sorted.
    ///
    /// These are the columns a physics residual row at `node` may depend on.
    pub fn connected_dofs(&self, node: usize) -> Vec<usize> {
        let mut dofs = Vec::new();
        for &element in self.mesh.node_elements(node) {
            for &n in self.mesh.element_nodes(element) {
                self.dof_map().extend_all_node_dofs(n, &mut dofs);
            }
        }
        dofs.sort_unstable();
        dofs.dedup();
        dofs
    }

    /// The physics residual at a DOF, with the variable scaling removed.
    pub fn unscaled_residual(&self, dof: usize) -> T {
        self.physics_residual[dof] / self.dof_map().scaling(dof)
    }

    /// The physics Jacobian entry, with the variable scaling removed. Zero outside Jacobian passes.
    pub fn unscaled_jacobian(&self, row: usize, col: usize) -> T {
        self.physics_jacobian
            .map_or(T::zero(), |jacobian| jacobian.get(row, col) / self.dof_map().scaling(row))
    }
}

/// Moves the physics residual of replaced secondary rows onto primary rows, weighted by the
/// primary shape functions. Primary rows are laid out node by node with the same components as
/// the secondary rows.
pub fn transfer_secondary_residual<T: Real>(
    ctx: &EvaluationContext<T>,
    basis: &[T],
    buffer: &mut LocalContributionBuffer<T>,
) {
    let secondary_dofs = buffer.row_dofs(RowSet::Secondary).to_vec();
    let nc = secondary_dofs.len();
    let residual = buffer.residual_mut(RowSet::Primary);
    for (c, &dof) in secondary_dofs.iter().enumerate() {
        let r = ctx.unscaled_residual(dof);
        for (a, &n_a) in basis.iter().enumerate() {
            residual[nc * a + c] += n_a * r;
        }
    }
}

/// The Jacobian counterpart of [`transfer_secondary_residual`]. Requires the connected column set
/// of the buffer to hold the connected DOFs of the secondary node.
pub fn transfer_secondary_jacobian<T: Real>(
    ctx: &EvaluationContext<T>,
    basis: &[T],
    buffer: &mut LocalContributionBuffer<T>,
) {
    let secondary_dofs = buffer.row_dofs(RowSet::Secondary).to_vec();
    let connected = buffer.column_dofs(ColumnSet::Connected).to_vec();
    let nc = secondary_dofs.len();
    let block = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Connected);
    for (c, &row) in secondary_dofs.iter().enumerate() {
        for (j, &col) in connected.iter().enumerate() {
            let value = ctx.unscaled_jacobian(row, col);
            if value != T::zero() {
                for (a, &n_a) in basis.iter().enumerate() {
                    block[(nc * a + c, j)] += n_a * value;
                }
            }
        }
    }
}

/// A secondary node coupled to its projection onto a primary surface.
pub trait NodeFaceConstraint<T: Real> {
    fn base(&self) -> &ConstraintBase<T>;

    /// Whether the secondary residual rows are replaced rather than added to.
    fn overwrites_secondary_residual(&self) -> bool {
        false
    }

    fn overwrites_secondary_jacobian(&self) -> bool {
        self.overwrites_secondary_residual()
    }

    fn search_settings(&self) -> &SearchSettings;

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base().check_variable(dof_map, None)
    }

    /// The active-set query. Evaluated once per secondary node and pass.
    fn should_apply(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>) -> ApplyDecision;

    /// Whether [`compute_secondary_value`](Self::compute_secondary_value) prescribes the
    /// secondary unknowns directly.
    fn prescribes_secondary_value(&self) -> bool {
        false
    }

    fn compute_secondary_value(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>, component: usize) -> T {
        ctx.field
            .nodal_value(info.secondary_node, self.base().variable, component)
    }

    fn compute_residual(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_jacobian(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    /// Jacobian blocks with respect to a coupled variable, whose DOFs make up the secondary and
    /// primary column sets. Called once per variable in
    /// [`ConstraintBase::coupled_variables`] during Jacobian passes.
    fn compute_off_diagonal_jacobian(
        &self,
        _info: &ProjectionInfo<T>,
        _ctx: &EvaluationContext<T>,
        _coupled: VariableId,
        _buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }

    /// Limits on the tangential slip per nonlinear update, if the constraint has friction.
    fn slip_damper(&self) -> Option<&SlipDamperSettings> {
        None
    }

    /// Whether the constraint takes part in augmented Lagrange iterations.
    fn is_augmented(&self) -> bool {
        false
    }

    /// Whether the augmented iteration has converged at the given node.
    fn augmented_converged(&self, _info: &ProjectionInfo<T>) -> bool {
        true
    }

    /// Updates the Lagrange multiplier estimate of one node.
    fn update_augmented_multiplier(&mut self, _info: &ProjectionInfo<T>) {}
}

/// A secondary node coupled to the primary element containing it.
pub trait NodeElemConstraint<T: Real> {
    fn base(&self) -> &ConstraintBase<T>;

    fn overwrites_secondary_residual(&self) -> bool {
        false
    }

    fn overwrites_secondary_jacobian(&self) -> bool {
        self.overwrites_secondary_residual()
    }

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base().check_variable(dof_map, None)
    }

    fn should_apply(&self, _secondary_node: usize, _location: &ElementLocation<T>, _ctx: &EvaluationContext<T>) -> bool {
        true
    }

    fn prescribes_secondary_value(&self) -> bool {
        false
    }

    fn compute_secondary_value(
        &self,
        secondary_node: usize,
        _location: &ElementLocation<T>,
        ctx: &EvaluationContext<T>,
        component: usize,
    ) -> T {
        ctx.field
            .nodal_value(secondary_node, self.base().variable, component)
    }

    fn compute_residual(
        &self,
        secondary_node: usize,
        location: &ElementLocation<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_jacobian(
        &self,
        secondary_node: usize,
        location: &ElementLocation<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_off_diagonal_jacobian(
        &self,
        _secondary_node: usize,
        _location: &ElementLocation<T>,
        _ctx: &EvaluationContext<T>,
        _coupled: VariableId,
        _buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// Choice of the Lagrange multiplier trial space of a mortar constraint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MortarBasis {
    /// The trace of the secondary shape functions.
    Standard,
    /// Functions biorthogonal to the secondary shape functions, which makes the coupling between
    /// multiplier and secondary DOFs diagonal.
    ///
    /// Biorthogonality holds only on secondary sides that the primary surface covers completely.
    /// Partially covered sides use the standard basis.
    Dual,
}

/// One mortar segment prepared for evaluation.
#[derive(Debug, Clone)]
pub struct MortarSegmentData<'a, T: Real> {
    pub secondary_nodes: &'a [usize],
    pub primary_nodes: &'a [usize],
    pub quadrature: &'a [MortarQuadraturePoint<T>],
    /// Whether the segments of this secondary side cover all of it.
    pub fully_covered: bool,
}

/// Integral coupling across mortar segments, enforced through a Lagrange multiplier that lives on
/// the secondary boundary nodes.
///
/// Buffer rows: the secondary rows hold the constrained variable on the secondary side nodes,
/// the primary rows the constrained variable on the primary side nodes and the lower rows the
/// multiplier on the secondary side nodes.
pub trait MortarConstraint<T: Real> {
    fn base(&self) -> &ConstraintBase<T>;

    fn lagrange_multiplier(&self) -> VariableId;

    fn basis(&self) -> MortarBasis;

    /// Number of Gauss points per segment.
    fn quadrature_points(&self) -> usize {
        2
    }

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError>;

    fn compute_residual(
        &self,
        segment: &MortarSegmentData<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_jacobian(
        &self,
        segment: &MortarSegmentData<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;
}

/// Integral coupling of paired sides across an interface.
pub trait ElemElemConstraint<T: Real> {
    fn base(&self) -> &ConstraintBase<T>;

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base().check_variable(dof_map, None)
    }

    fn compute_residual(
        &self,
        pair: &InterfaceSidePair,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_jacobian(
        &self,
        pair: &InterfaceSidePair,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;
}

/// A secondary node coupled to its nearest primary node.
pub trait NodalConstraint<T: Real> {
    fn base(&self) -> &ConstraintBase<T>;

    fn search_settings(&self) -> &SearchSettings;

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base().check_variable(dof_map, None)
    }

    fn should_apply(&self, _secondary_node: usize, _nearest: &NearestNode<T>, _ctx: &EvaluationContext<T>) -> bool {
        true
    }

    fn compute_residual(
        &self,
        secondary_node: usize,
        primary_node: usize,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;

    fn compute_jacobian(
        &self,
        secondary_node: usize,
        primary_node: usize,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError>;
}

/// A constraint of any kind.
pub enum Constraint<T: Real> {
    Nodal(Box<dyn NodalConstraint<T>>),
    NodeFace(Box<dyn NodeFaceConstraint<T>>),
    NodeElem(Box<dyn NodeElemConstraint<T>>),
    Mortar(Box<dyn MortarConstraint<T>>),
    ElemElem(Box<dyn ElemElemConstraint<T>>),
}

macro_rules! dispatch {
    ($constraint:expr, $inner:ident => $body:expr) => {
        match $constraint {
            Constraint::Nodal($inner) => $body,
            Constraint::NodeFace($inner) => $body,
            Constraint::NodeElem($inner) => $body,
            Constraint::Mortar($inner) => $body,
            Constraint::ElemElem($inner) => $body,
        }
    };
}

impl<T: Real> Constraint<T> {
    pub fn node_face(constraint: impl NodeFaceConstraint<T> + 'static) -> Self {
        Self::NodeFace(Box::new(constraint))
    }

    pub fn node_elem(constraint: impl NodeElemConstraint<T> + 'static) -> Self {
        Self::NodeElem(Box::new(constraint))
    }

    pub fn mortar(constraint: impl MortarConstraint<T> + 'static) -> Self {
        Self::Mortar(Box::new(constraint))
    }

    pub fn elem_elem(constraint: impl ElemElemConstraint<T> + 'static) -> Self {
        Self::ElemElem(Box::new(constraint))
    }

    pub fn nodal(constraint: impl NodalConstraint<T> + 'static) -> Self {
        Self::Nodal(Box::new(constraint))
    }

    pub fn kind(&self) -> ConstraintKind {
        match self {
            Self::Nodal(_) => ConstraintKind::Nodal,
            Self::NodeFace(_) => ConstraintKind::NodeFace,
            Self::NodeElem(_) => ConstraintKind::NodeElem,
            Self::Mortar(_) => ConstraintKind::Mortar,
            Self::ElemElem(_) => ConstraintKind::ElemElem,
        }
    }

    pub fn base(&self) -> &ConstraintBase<T> {
        dispatch!(self, c => c.base())
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn overwrites_secondary_residual(&self) -> bool {
        match self {
            Self::NodeFace(c) => c.overwrites_secondary_residual(),
            Self::NodeElem(c) => c.overwrites_secondary_residual(),
            _ => false,
        }
    }

    pub fn overwrites_secondary_jacobian(&self) -> bool {
        match self {
            Self::NodeFace(c) => c.overwrites_secondary_jacobian(),
            Self::NodeElem(c) => c.overwrites_secondary_jacobian(),
            _ => false,
        }
    }

    pub fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        dispatch!(self, c => c.validate(dof_map))
    }
}

impl<T: Real> Debug for Constraint<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
