use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{
    transfer_secondary_jacobian, transfer_secondary_residual, ConstraintBase, EvaluationContext, NodeElemConstraint,
};
use crate::error::EvaluationError;
use crate::search::ElementLocation;
use crate::Real;

/// Forces a variable at the nodes of a secondary subdomain to equal its interpolant in the
/// primary element that contains each node.
///
/// Used to embed one mesh in another: the secondary rows are replaced and the secondary physics
/// residual is distributed to the nodes of the containing element.
#[derive(Debug, Clone)]
pub struct EqualValueNodeElemConstraint<T: Real> {
    base: ConstraintBase<T>,
    scale: T,
}

impl<T: Real> EqualValueNodeElemConstraint<T> {
    pub fn new(base: ConstraintBase<T>) -> Self {
        Self { base, scale: T::one() }
    }

    pub fn with_scale(self, scale: T) -> Self {
        Self { scale, ..self }
    }
}

impl<T: Real> NodeElemConstraint<T> for EqualValueNodeElemConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn overwrites_secondary_residual(&self) -> bool {
        true
    }

    fn prescribes_secondary_value(&self) -> bool {
        true
    }

    fn compute_secondary_value(
        &self,
        _secondary_node: usize,
        location: &ElementLocation<T>,
        ctx: &EvaluationContext<T>,
        component: usize,
    ) -> T {
        ctx.field
            .interpolate(&location.nodes, &location.basis, self.base.variable, component)
    }

    fn compute_residual(
        &self,
        secondary_node: usize,
        location: &ElementLocation<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = buffer.row_dofs(RowSet::Secondary).len();
        for c in 0..nc {
            let u_s = ctx.field.nodal_value(secondary_node, self.base.variable, c);
            let u_p = ctx
                .field
                .interpolate(&location.nodes, &location.basis, self.base.variable, c);
            buffer.residual_mut(RowSet::Secondary)[c] = self.scale * (u_s - u_p);
        }
        transfer_secondary_residual(ctx, &location.basis, buffer);
        Ok(())
    }

    fn compute_jacobian(
        &self,
        _secondary_node: usize,
        location: &ElementLocation<T>,
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
            for (a, &n_a) in location.basis.iter().enumerate() {
                for c in 0..nc {
                    j_sp[(c, nc * a + c)] -= self.scale * n_a;
                }
            }
        }
        transfer_secondary_jacobian(ctx, &location.basis, buffer);
        Ok(())
    }
}
