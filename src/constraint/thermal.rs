use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{ApplyDecision, ConstraintBase, EvaluationContext, NodeFaceConstraint};
use crate::dof::{DofMap, VariableId};
use crate::error::{ConfigurationError, EvaluationError};
use crate::search::{ProjectionInfo, SearchSettings};
use crate::Real;
use numeric_literals::replace_float_literals;

/// Heat transfer between a secondary node and the primary surface across a gap.
///
/// The heat flux leaving the secondary node is `h(g) (T_s - T_p)`, where `T_p` is the temperature
/// interpolated at the closest point and `h(g) = conductivity / max(g, min_gap)`. The gap is
/// opened by `displacement`, which is always among the coupled variables and receives the
/// off-diagonal Jacobian. Variations of the closest point along the side are neglected.
#[derive(Debug, Clone)]
pub struct GapConductanceConstraint<T: Real> {
    base: ConstraintBase<T>,
    displacement: VariableId,
    conductivity: T,
    min_gap: T,
    search: SearchSettings,
}

impl<T: Real> GapConductanceConstraint<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn new(base: ConstraintBase<T>, displacement: VariableId, conductivity: T) -> Self {
        let mut coupled = base.coupled_variables.clone();
        if !coupled.contains(&displacement) {
            coupled.push(displacement);
        }
        Self {
            base: base.with_coupled_variables(coupled),
            displacement,
            conductivity,
            min_gap: 1e-6,
            search: SearchSettings::default(),
        }
    }

    pub fn with_min_gap(self, min_gap: T) -> Self {
        Self { min_gap, ..self }
    }

    pub fn with_search_settings(self, search: SearchSettings) -> Self {
        Self { search, ..self }
    }

    pub fn conductance(&self, gap: T) -> T {
        self.conductivity / gap.max(self.min_gap)
    }

    /// Derivative of the conductance with respect to the gap.
    fn conductance_derivative(&self, gap: T) -> T {
        if gap > self.min_gap {
            -self.conductivity / (gap * gap)
        } else {
            T::zero()
        }
    }

    fn temperature_jump(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>) -> T {
        let variable = self.base.variable;
        let secondary = ctx.field.nodal_value(info.secondary_node, variable, 0);
        let primary = ctx
            .field
            .interpolate(&info.side_nodes, &info.side_basis, variable, 0);
        secondary - primary
    }
}

impl<T: Real> NodeFaceConstraint<T> for GapConductanceConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn search_settings(&self) -> &SearchSettings {
        &self.search
    }

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base.check_variable(dof_map, Some(1))?;
        if dof_map.num_components(self.displacement) != 2 {
            return Err(ConfigurationError::MissingVariable {
                constraint: self.base.name.clone(),
                variable: dof_map.variable(self.displacement).name.clone(),
            });
        }
        Ok(())
    }

    fn should_apply(&self, info: &ProjectionInfo<T>, _ctx: &EvaluationContext<T>) -> ApplyDecision {
        if info.within_side {
            ApplyDecision::apply()
        } else {
            ApplyDecision::skip()
        }
    }

    fn compute_residual(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let flux = self.conductance(info.gap) * self.temperature_jump(info, ctx);
        buffer.residual_mut(RowSet::Secondary)[0] += flux;
        let primary = buffer.residual_mut(RowSet::Primary);
        for (a, &n_a) in info.side_basis.iter().enumerate() {
            primary[a] -= n_a * flux;
        }
        Ok(())
    }

    fn compute_jacobian(
        &self,
        info: &ProjectionInfo<T>,
        _ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let h = self.conductance(info.gap);
        let basis = &info.side_basis;
        buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary)[(0, 0)] += h;
        {
            let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
            for (b, &n_b) in basis.iter().enumerate() {
                j_sp[(0, b)] -= h * n_b;
            }
        }
        {
            let j_ps = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Secondary);
            for (a, &n_a) in basis.iter().enumerate() {
                j_ps[(a, 0)] -= h * n_a;
            }
        }
        let j_pp = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Primary);
        for (a, &n_a) in basis.iter().enumerate() {
            for (b, &n_b) in basis.iter().enumerate() {
                j_pp[(a, b)] += h * n_a * n_b;
            }
        }
        Ok(())
    }

    fn compute_off_diagonal_jacobian(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        coupled: VariableId,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        if coupled != self.displacement {
            return Ok(());
        }
        // d(flux)/d(gap); the gap varies with n . (du_s - sum_a N_a du_a)
        let dflux = self.conductance_derivative(info.gap) * self.temperature_jump(info, ctx);
        let n = info.normal;
        let basis = &info.side_basis;
        {
            let j_ss = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary);
            for c in 0..2 {
                j_ss[(0, c)] += dflux * n[c];
            }
        }
        {
            let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
            for (b, &n_b) in basis.iter().enumerate() {
                for c in 0..2 {
                    j_sp[(0, 2 * b + c)] -= dflux * n_b * n[c];
                }
            }
        }
        {
            let j_ps = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Secondary);
            for (a, &n_a) in basis.iter().enumerate() {
                for c in 0..2 {
                    j_ps[(a, c)] -= n_a * dflux * n[c];
                }
            }
        }
        let j_pp = buffer.jacobian_mut(RowSet::Primary, ColumnSet::Primary);
        for (a, &n_a) in basis.iter().enumerate() {
            for (b, &n_b) in basis.iter().enumerate() {
                for c in 0..2 {
                    j_pp[(a, 2 * b + c)] += n_a * dflux * n_b * n[c];
                }
            }
        }
        Ok(())
    }
}
