use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{
    transfer_secondary_jacobian, transfer_secondary_residual, ApplyDecision, ConstraintBase, EvaluationContext,
    FrictionSettings, NodeFaceConstraint, SlipDamperSettings,
};
use crate::dof::DofMap;
use crate::error::{ConfigurationError, EvaluationError};
use crate::search::{MechanicalStatus, ProjectionInfo, SearchSettings, StateRequest};
use crate::Real;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the non-penetration condition is enforced.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactFormulation {
    /// The secondary residual rows are replaced by the gap equation, and the secondary physics
    /// residual is transferred to the primary surface.
    Kinematic,
    /// A penalty force proportional to the penetration.
    Penalty,
    /// A penalty force offset by a Lagrange multiplier estimate that is updated in outer
    /// iterations.
    AugmentedLagrange,
}

/// The tangential behavior of the contact.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactModel {
    Frictionless,
    /// Captured nodes neither separate nor slide.
    Glued,
    Coulomb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSettings {
    pub formulation: ContactFormulation,
    pub model: ContactModel,
    /// Normal penalty. For the kinematic formulation, the scaling of the gap equation.
    pub penalty: f64,
    pub friction: FrictionSettings,
    /// Uncaptured nodes whose gap falls below this value are captured. Kinematic formulation only.
    pub capture_tolerance: f64,
    /// Augmented Lagrange iterations have converged once no captured node penetrates farther.
    pub penetration_tolerance: f64,
    pub search: SearchSettings,
    pub slip_damper: Option<SlipDamperSettings>,
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self {
            formulation: ContactFormulation::Kinematic,
            model: ContactModel::Frictionless,
            penalty: 1e4,
            friction: FrictionSettings::default(),
            capture_tolerance: 0.0,
            penetration_tolerance: 1e-6,
            search: SearchSettings::default(),
            slip_damper: None,
        }
    }
}

/// Node-to-surface contact between two deformable bodies for a two-component displacement
/// variable.
///
/// Sign conventions: the gap is positive when open, the normal is the outward normal of the
/// primary surface and the contact pressure is positive in compression.
#[derive(Debug, Clone)]
pub struct MechanicalContactConstraint<T: Real> {
    base: ConstraintBase<T>,
    settings: ContactSettings,
    multipliers: BTreeMap<usize, T>,
}

impl<T: Real> MechanicalContactConstraint<T> {
    pub fn new(base: ConstraintBase<T>, settings: ContactSettings) -> Result<Self, ConfigurationError> {
        let unsupported = |reason: &str| ConfigurationError::UnsupportedContactModel {
            constraint: base.name.clone(),
            reason: reason.to_string(),
        };
        match (settings.formulation, settings.model) {
            (ContactFormulation::Kinematic, ContactModel::Coulomb) => {
                return Err(unsupported("Coulomb friction requires the penalty or augmented Lagrange formulation"));
            }
            (ContactFormulation::AugmentedLagrange, ContactModel::Glued) => {
                return Err(unsupported("glued contact has no augmented Lagrange multiplier update"));
            }
            _ => {}
        }
        if settings.penalty <= 0.0 {
            return Err(unsupported("the penalty must be positive"));
        }
        if settings.friction.coefficient < 0.0 {
            return Err(unsupported("the friction coefficient must be non-negative"));
        }
        Ok(Self {
            base,
            settings,
            multipliers: BTreeMap::new(),
        })
    }

    pub fn settings(&self) -> &ContactSettings {
        &self.settings
    }

    /// The normal Lagrange multiplier estimate of a node. Zero unless augmented.
    pub fn multiplier(&self, node: usize) -> T {
        self.multipliers
            .get(&node)
            .copied()
            .unwrap_or_else(T::zero)
    }

    fn penalty(&self) -> T {
        T::from_f64(self.settings.penalty).unwrap()
    }

    fn tangential_penalty(&self) -> T {
        T::from_f64(
            self.settings
                .friction
                .tangential_penalty
                .unwrap_or(self.settings.penalty),
        )
        .unwrap()
    }

    fn friction_coefficient(&self) -> T {
        T::from_f64(self.settings.friction.coefficient).unwrap()
    }

    /// Secondary displacement DOFs of a node.
    fn secondary_dofs(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>) -> Vec<usize> {
        ctx.nodes_dofs(&[info.secondary_node], self.base.variable)
    }

    /// The normal contact pressure at a node, positive in compression.
    ///
    /// For the kinematic formulation this is the normal component of the physics residual at the
    /// secondary node; otherwise it is the penalty pressure.
    pub fn contact_pressure(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>) -> T {
        match self.settings.formulation {
            ContactFormulation::Kinematic => {
                let dofs = self.secondary_dofs(info, ctx);
                let r = Vector2::new(ctx.unscaled_residual(dofs[0]), ctx.unscaled_residual(dofs[1]));
                r.dot(&info.normal)
            }
            _ => self.multiplier(info.secondary_node) - self.penalty() * info.gap,
        }
    }

    fn mechanical_status(&self, info: &ProjectionInfo<T>, pressure: T) -> MechanicalStatus {
        match self.settings.model {
            ContactModel::Frictionless => MechanicalStatus::Slipping,
            ContactModel::Glued => MechanicalStatus::Sticking,
            ContactModel::Coulomb => {
                let trial = self.tangential_penalty() * info.incremental_slip;
                if trial.abs() <= self.friction_coefficient() * pressure {
                    MechanicalStatus::Sticking
                } else {
                    MechanicalStatus::SlippingFriction
                }
            }
        }
    }

    /// The tangential force on the secondary node along the tangent.
    fn friction_force(&self, info: &ProjectionInfo<T>, pressure: T) -> T {
        match self.mechanical_status(info, pressure) {
            MechanicalStatus::Sticking => -self.tangential_penalty() * info.incremental_slip,
            MechanicalStatus::SlippingFriction => -self.friction_coefficient() * pressure * sign(info.incremental_slip),
            _ => T::zero(),
        }
    }

    fn engaged(&self, info: &ProjectionInfo<T>, pressure: T) -> bool {
        if info.captured && self.settings.model == ContactModel::Glued {
            return true;
        }
        if !info.within_side {
            return false;
        }
        match self.settings.formulation {
            ContactFormulation::Kinematic if info.captured => pressure >= T::zero(),
            ContactFormulation::Kinematic => info.gap <= T::from_f64(self.settings.capture_tolerance).unwrap(),
            _ => pressure > T::zero(),
        }
    }
}

fn sign<T: Real>(value: T) -> T {
    if value < T::zero() {
        -T::one()
    } else {
        T::one()
    }
}

impl<T: Real> NodeFaceConstraint<T> for MechanicalContactConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn overwrites_secondary_residual(&self) -> bool {
        self.settings.formulation == ContactFormulation::Kinematic
    }

    fn search_settings(&self) -> &SearchSettings {
        &self.settings.search
    }

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base.check_variable(dof_map, Some(2))
    }

    fn should_apply(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>) -> ApplyDecision {
        let pressure = self.contact_pressure(info, ctx);
        if !self.engaged(info, pressure) {
            return if info.captured {
                ApplyDecision::skip().with_request(StateRequest::Release)
            } else {
                ApplyDecision::skip()
            };
        }
        let mut decision = ApplyDecision::apply();
        if !info.captured {
            decision = decision.with_request(StateRequest::Capture);
        }
        let status = self.mechanical_status(info, pressure);
        if status != info.mechanical_status || !info.captured {
            decision = decision.with_request(StateRequest::SetStatus(status));
        }
        decision
    }

    fn compute_residual(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let n = info.normal;
        let t = info.tangent;
        let k = self.penalty();
        let basis = &info.side_basis;

        // Force acting on the secondary node; the primary side receives its reaction
        let force = match (self.settings.formulation, self.settings.model) {
            (ContactFormulation::Kinematic, ContactModel::Glued) => {
                let r_s = (n * info.gap + t * info.incremental_slip) * k;
                buffer
                    .residual_mut(RowSet::Secondary)
                    .copy_from_slice(r_s.as_slice());
                transfer_secondary_residual(ctx, basis, buffer);
                return Ok(());
            }
            (ContactFormulation::Kinematic, _) => {
                let dofs = self.secondary_dofs(info, ctx);
                let r = Vector2::new(ctx.unscaled_residual(dofs[0]), ctx.unscaled_residual(dofs[1]));
                let pressure = r.dot(&n);
                let r_s = r - n * pressure + n * (k * info.gap);
                buffer
                    .residual_mut(RowSet::Secondary)
                    .copy_from_slice(r_s.as_slice());
                let primary = buffer.residual_mut(RowSet::Primary);
                for (a, &n_a) in basis.iter().enumerate() {
                    primary[2 * a] += n_a * pressure * n.x;
                    primary[2 * a + 1] += n_a * pressure * n.y;
                }
                return Ok(());
            }
            (_, ContactModel::Glued) => {
                let pressure = -k * info.gap;
                n * pressure - t * (k * info.incremental_slip)
            }
            (_, model) => {
                let pressure = self.contact_pressure(info, ctx);
                let mut force = n * pressure;
                if model == ContactModel::Coulomb {
                    force += t * self.friction_force(info, pressure);
                }
                force
            }
        };

        let secondary = buffer.residual_mut(RowSet::Secondary);
        secondary[0] -= force.x;
        secondary[1] -= force.y;
        let primary = buffer.residual_mut(RowSet::Primary);
        for (a, &n_a) in basis.iter().enumerate() {
            primary[2 * a] += n_a * force.x;
            primary[2 * a + 1] += n_a * force.y;
        }
        Ok(())
    }

    fn compute_jacobian(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let n = info.normal;
        let t = info.tangent;
        let k = self.penalty();
        let basis = &info.side_basis;

        match (self.settings.formulation, self.settings.model) {
            (ContactFormulation::Kinematic, ContactModel::Glued) => {
                {
                    let j_ss = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary);
                    j_ss[(0, 0)] += k;
                    j_ss[(1, 1)] += k;
                }
                {
                    let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
                    for (a, &n_a) in basis.iter().enumerate() {
                        j_sp[(0, 2 * a)] -= k * n_a;
                        j_sp[(1, 2 * a + 1)] -= k * n_a;
                    }
                }
                transfer_secondary_jacobian(ctx, basis, buffer);
            }
            (ContactFormulation::Kinematic, _) => {
                let dofs = self.secondary_dofs(info, ctx);
                let connected = buffer.column_dofs(ColumnSet::Connected).to_vec();
                // Normal projection of the physics Jacobian rows of the secondary node
                let projected: Vec<(Vector2<T>, T)> = connected
                    .iter()
                    .map(|&col| {
                        let dr = Vector2::new(ctx.unscaled_jacobian(dofs[0], col), ctx.unscaled_jacobian(dofs[1], col));
                        (dr, n.dot(&dr))
                    })
                    .collect();
                {
                    let j_sc = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Connected);
                    for (j, (dr, dn)) in projected.iter().enumerate() {
                        for c in 0..2 {
                            j_sc[(c, j)] += dr[c] - n[c] * *dn;
                        }
                    }
                }
                {
                    let j_pc = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Connected);
                    for (j, (_, dn)) in projected.iter().enumerate() {
                        for (a, &n_a) in basis.iter().enumerate() {
                            for c in 0..2 {
                                j_pc[(2 * a + c, j)] += n_a * n[c] * *dn;
                            }
                        }
                    }
                }
                // Linearization of the gap
                {
                    let j_ss = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary);
                    for c in 0..2 {
                        for d in 0..2 {
                            j_ss[(c, d)] += k * n[c] * n[d];
                        }
                    }
                }
                let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
                for (a, &n_a) in basis.iter().enumerate() {
                    for c in 0..2 {
                        for d in 0..2 {
                            j_sp[(c, 2 * a + d)] -= k * n_a * n[c] * n[d];
                        }
                    }
                }
            }
            (_, ContactModel::Glued) => {
                buffer.add_coupled_pair_jacobian(k, &n, &n, basis);
                buffer.add_coupled_pair_jacobian(k, &t, &t, basis);
            }
            (_, model) => {
                buffer.add_coupled_pair_jacobian(k, &n, &n, basis);
                if model == ContactModel::Coulomb {
                    let pressure = self.contact_pressure(info, ctx);
                    match self.mechanical_status(info, pressure) {
                        MechanicalStatus::Sticking => {
                            buffer.add_coupled_pair_jacobian(self.tangential_penalty(), &t, &t, basis);
                        }
                        MechanicalStatus::SlippingFriction => {
                            let kappa = -self.friction_coefficient() * k * sign(info.incremental_slip);
                            buffer.add_coupled_pair_jacobian(kappa, &t, &n, basis);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn slip_damper(&self) -> Option<&SlipDamperSettings> {
        match self.settings.model {
            ContactModel::Coulomb => self.settings.slip_damper.as_ref(),
            _ => None,
        }
    }

    fn is_augmented(&self) -> bool {
        self.settings.formulation == ContactFormulation::AugmentedLagrange
    }

    fn augmented_converged(&self, info: &ProjectionInfo<T>) -> bool {
        !info.captured || info.gap.abs() <= T::from_f64(self.settings.penetration_tolerance).unwrap()
    }

    fn update_augmented_multiplier(&mut self, info: &ProjectionInfo<T>) {
        let node = info.secondary_node;
        if info.captured {
            let lambda = self.multiplier(node) - self.penalty() * info.gap;
            self.multipliers.insert(node, lambda.max(T::zero()));
        } else {
            self.multipliers.remove(&node);
        }
    }
}
