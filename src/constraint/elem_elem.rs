use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{ConstraintBase, ElemElemConstraint, EvaluationContext};
use crate::element::side_segment;
use crate::error::EvaluationError;
use crate::geometry::{populate_segment_basis, ProjectionSettings};
use crate::quadrature::gauss;
use crate::search::InterfaceSidePair;
use crate::Real;
use itertools::izip;

/// Penalizes the jump of a variable across an interface, integrated over the secondary side of
/// each interface side pair.
///
/// The penalty term is `k int [u] [v]` with the jump `[u] = u_s - u_p`, where the primary value is
/// evaluated at the closest point of the paired primary side.
#[derive(Debug, Clone)]
pub struct InterfacePenaltyConstraint<T: Real> {
    base: ConstraintBase<T>,
    penalty: T,
    quadrature_points: usize,
    projection: ProjectionSettings,
}

impl<T: Real> InterfacePenaltyConstraint<T> {
    pub fn new(base: ConstraintBase<T>, penalty: T) -> Self {
        Self {
            base,
            penalty,
            quadrature_points: 2,
            projection: ProjectionSettings::default(),
        }
    }

    pub fn with_quadrature_points(self, quadrature_points: usize) -> Self {
        Self {
            quadrature_points,
            ..self
        }
    }

    /// Calls `f(weight, secondary basis, primary basis)` at every quadrature point of the pair.
    fn for_each_point(&self, pair: &InterfaceSidePair, ctx: &EvaluationContext<T>, mut f: impl FnMut(T, &[T], &[T])) {
        let secondary = side_segment(ctx.positions, &pair.secondary_nodes);
        let primary = side_segment(ctx.positions, &pair.primary_nodes);
        let mut n_s = vec![T::zero(); pair.secondary_nodes.len()];
        let mut n_p = vec![T::zero(); pair.primary_nodes.len()];
        let (weights, points) = gauss::<T>(self.quadrature_points);
        for (w, xi) in izip!(weights, points) {
            let x = secondary.map_reference_coords(xi);
            let projection = primary.project_point(&x, &self.projection);
            populate_segment_basis(&mut n_s, xi);
            populate_segment_basis(&mut n_p, projection.xi);
            f(w * secondary.jacobian_determinant(xi), &n_s, &n_p);
        }
    }
}

impl<T: Real> ElemElemConstraint<T> for InterfacePenaltyConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn compute_residual(
        &self,
        pair: &InterfaceSidePair,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let variable = self.base.variable;
        let nc = ctx.dof_map().num_components(variable);
        let k = self.penalty;
        self.for_each_point(pair, ctx, |w, n_s, n_p| {
            for c in 0..nc {
                let jump = ctx
                    .field
                    .interpolate(&pair.secondary_nodes, n_s, variable, c)
                    - ctx
                        .field
                        .interpolate(&pair.primary_nodes, n_p, variable, c);
                for (a, n_a) in n_s.iter().enumerate() {
                    buffer.residual_mut(RowSet::Secondary)[nc * a + c] += w * k * jump * *n_a;
                }
                for (a, n_a) in n_p.iter().enumerate() {
                    buffer.residual_mut(RowSet::Primary)[nc * a + c] -= w * k * jump * *n_a;
                }
            }
        });
        Ok(())
    }

    fn compute_jacobian(
        &self,
        pair: &InterfaceSidePair,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = ctx.dof_map().num_components(self.base.variable);
        let k = self.penalty;
        self.for_each_point(pair, ctx, |w, n_s, n_p| {
            let blocks = [
                (RowSet::Secondary, ColumnSet::Secondary, n_s, n_s, T::one()),
                (RowSet::Secondary, ColumnSet::Primary, n_s, n_p, -T::one()),
                (RowSet::Primary, ColumnSet::Secondary, n_p, n_s, -T::one()),
                (RowSet::Primary, ColumnSet::Primary, n_p, n_p, T::one()),
            ];
            for (rows, columns, row_basis, col_basis, sign) in blocks {
                let block = buffer.jacobian_mut(rows, columns);
                for (a, n_a) in row_basis.iter().enumerate() {
                    for (b, n_b) in col_basis.iter().enumerate() {
                        for c in 0..nc {
                            block[(nc * a + c, nc * b + c)] += sign * w * k * *n_a * *n_b;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
