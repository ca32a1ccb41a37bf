use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{ConstraintBase, EvaluationContext, NodalConstraint};
use crate::error::EvaluationError;
use crate::search::{NearestNode, SearchSettings};
use crate::Real;

/// Couples each secondary node to its nearest primary node with a penalty `k (u_s - u_p)`.
#[derive(Debug, Clone)]
pub struct NodalPenaltyConstraint<T: Real> {
    base: ConstraintBase<T>,
    penalty: T,
    /// Pairs farther apart than this are not coupled.
    max_distance: Option<T>,
    search: SearchSettings,
}

impl<T: Real> NodalPenaltyConstraint<T> {
    pub fn new(base: ConstraintBase<T>, penalty: T) -> Self {
        Self {
            base,
            penalty,
            max_distance: None,
            search: SearchSettings::default(),
        }
    }

    pub fn with_max_distance(self, max_distance: T) -> Self {
        Self {
            max_distance: Some(max_distance),
            ..self
        }
    }
}

impl<T: Real> NodalConstraint<T> for NodalPenaltyConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn search_settings(&self) -> &SearchSettings {
        &self.search
    }

    fn should_apply(&self, _secondary_node: usize, nearest: &NearestNode<T>, _ctx: &EvaluationContext<T>) -> bool {
        self.max_distance
            .map_or(true, |max_distance| nearest.distance <= max_distance)
    }

    fn compute_residual(
        &self,
        secondary_node: usize,
        primary_node: usize,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = buffer.row_dofs(RowSet::Secondary).len();
        for c in 0..nc {
            let jump = ctx.field.nodal_value(secondary_node, self.base.variable, c)
                - ctx.field.nodal_value(primary_node, self.base.variable, c);
            buffer.residual_mut(RowSet::Secondary)[c] += self.penalty * jump;
            buffer.residual_mut(RowSet::Primary)[c] -= self.penalty * jump;
        }
        Ok(())
    }

    fn compute_jacobian(
        &self,
        _secondary_node: usize,
        _primary_node: usize,
        _ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = buffer.row_dofs(RowSet::Secondary).len();
        let k = self.penalty;
        for (rows, columns, value) in [
            (RowSet::Secondary, ColumnSet::Secondary, k),
            (RowSet::Secondary, ColumnSet::Primary, -k),
            (RowSet::Primary, ColumnSet::Secondary, -k),
            (RowSet::Primary, ColumnSet::Primary, k),
        ] {
            let block = buffer.jacobian_mut(rows, columns);
            for c in 0..nc {
                block[(c, c)] += value;
            }
        }
        Ok(())
    }
}
