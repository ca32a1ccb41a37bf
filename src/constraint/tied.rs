use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{
    transfer_secondary_jacobian, transfer_secondary_residual, ApplyDecision, ConstraintBase, EvaluationContext,
    NodeFaceConstraint,
};
use crate::error::EvaluationError;
use crate::search::{ProjectionInfo, SearchSettings};
use crate::Real;

/// Ties every component of a variable at secondary nodes to its interpolant on the primary
/// surface.
///
/// The secondary rows are replaced by `scale * (u_s - sum_a N_a u_a)`, and the secondary physics
/// residual is carried over to the primary nodes. Nodes whose projection falls outside the primary
/// surface are left alone.
#[derive(Debug, Clone)]
pub struct TiedValueConstraint<T: Real> {
    base: ConstraintBase<T>,
    scale: T,
    search: SearchSettings,
}

impl<T: Real> TiedValueConstraint<T> {
    pub fn new(base: ConstraintBase<T>) -> Self {
        Self {
            base,
            scale: T::one(),
            search: SearchSettings::default(),
        }
    }

    pub fn with_scale(self, scale: T) -> Self {
        Self { scale, ..self }
    }

    pub fn with_search_settings(self, search: SearchSettings) -> Self {
        Self { search, ..self }
    }

    fn primary_value(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>, component: usize) -> T {
        ctx.field
            .interpolate(&info.side_nodes, &info.side_basis, self.base.variable, component)
    }
}

impl<T: Real> NodeFaceConstraint<T> for TiedValueConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn overwrites_secondary_residual(&self) -> bool {
        true
    }

    fn search_settings(&self) -> &SearchSettings {
        &self.search
    }

    fn should_apply(&self, info: &ProjectionInfo<T>, _ctx: &EvaluationContext<T>) -> ApplyDecision {
        if info.within_side {
            ApplyDecision::apply()
        } else {
            ApplyDecision::skip()
        }
    }

    fn prescribes_secondary_value(&self) -> bool {
        true
    }

    fn compute_secondary_value(&self, info: &ProjectionInfo<T>, ctx: &EvaluationContext<T>, component: usize) -> T {
        self.primary_value(info, ctx, component)
    }

    fn compute_residual(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = buffer.row_dofs(RowSet::Secondary).len();
        for c in 0..nc {
            let u_s = ctx
                .field
                .nodal_value(info.secondary_node, self.base.variable, c);
            buffer.residual_mut(RowSet::Secondary)[c] = self.scale * (u_s - self.primary_value(info, ctx, c));
        }
        transfer_secondary_residual(ctx, &info.side_basis, buffer);
        Ok(())
    }

    fn compute_jacobian(
        &self,
        info: &ProjectionInfo<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = buffer.row_dofs(RowSet::Secondary).len();
        {
            let j_ss = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary);
            for c in 0..nc {
                j_ss[(c, c)] += self.scale;
            }
        }
        {
            let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
            for (a, &n_a) in info.side_basis.iter().enumerate() {
                for c in 0..nc {
                    j_sp[(c, nc * a + c)] -= self.scale * n_a;
                }
            }
        }
        transfer_secondary_jacobian(ctx, &info.side_basis, buffer);
        Ok(())
    }
}
