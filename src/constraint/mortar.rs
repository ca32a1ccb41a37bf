use crate::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use crate::constraint::{ConstraintBase, EvaluationContext, MortarBasis, MortarConstraint, MortarSegmentData};
use crate::dof::{DofMap, VariableId};
use crate::error::{ConfigurationError, EvaluationError};
use crate::geometry::populate_segment_basis;
use crate::Real;
use numeric_literals::replace_float_literals;

/// Weakly enforces `u_s = u_p` across a non-conforming interface with a Lagrange multiplier.
///
/// With multiplier `lambda` interpolated by the functions `phi`, the contributions are
/// `int lambda N_s` to the secondary rows, `-int lambda N_p` to the primary rows and
/// `int phi (u_s - u_p)` to the multiplier rows.
#[derive(Debug, Clone)]
pub struct EqualValueMortarConstraint<T: Real> {
    base: ConstraintBase<T>,
    multiplier: VariableId,
    basis: MortarBasis,
    quadrature_points: usize,
}

impl<T: Real> EqualValueMortarConstraint<T> {
    pub fn new(base: ConstraintBase<T>, multiplier: VariableId) -> Self {
        Self {
            base,
            multiplier,
            basis: MortarBasis::Standard,
            quadrature_points: 2,
        }
    }

    pub fn with_basis(self, basis: MortarBasis) -> Self {
        Self { basis, ..self }
    }

    pub fn with_quadrature_points(self, quadrature_points: usize) -> Self {
        Self {
            quadrature_points,
            ..self
        }
    }
}

/// The multiplier shape functions at a point, given the secondary shape functions there.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn multiplier_basis<T: Real>(basis: MortarBasis, secondary: &[T; 2]) -> [T; 2] {
    match basis {
        MortarBasis::Standard => *secondary,
        MortarBasis::Dual => [
            2.0 * secondary[0] - secondary[1],
            2.0 * secondary[1] - secondary[0],
        ],
    }
}

struct PointBasis<T> {
    weight: T,
    secondary: [T; 2],
    primary: [T; 2],
    multiplier: [T; 2],
}

impl<T: Real> EqualValueMortarConstraint<T> {
    fn point_bases<'a>(&'a self, segment: &'a MortarSegmentData<T>) -> impl Iterator<Item = PointBasis<T>> + 'a {
        let basis = if segment.fully_covered {
            self.basis
        } else {
            MortarBasis::Standard
        };
        segment.quadrature.iter().map(move |qp| {
            let mut secondary = [T::zero(); 2];
            let mut primary = [T::zero(); 2];
            populate_segment_basis(&mut secondary, qp.secondary_xi);
            populate_segment_basis(&mut primary, qp.primary_xi);
            PointBasis {
                weight: qp.weight,
                secondary,
                primary,
                multiplier: multiplier_basis(basis, &secondary),
            }
        })
    }
}

impl<T: Real> MortarConstraint<T> for EqualValueMortarConstraint<T> {
    fn base(&self) -> &ConstraintBase<T> {
        &self.base
    }

    fn lagrange_multiplier(&self) -> VariableId {
        self.multiplier
    }

    fn basis(&self) -> MortarBasis {
        self.basis
    }

    fn quadrature_points(&self) -> usize {
        self.quadrature_points
    }

    fn validate(&self, dof_map: &DofMap<T>) -> Result<(), ConfigurationError> {
        self.base.check_variable(dof_map, None)?;
        let nc = dof_map.num_components(self.base.variable);
        let valid = dof_map.variable_ids().any(|id| id == self.multiplier)
            && dof_map.num_components(self.multiplier) == nc;
        if valid {
            Ok(())
        } else {
            Err(ConfigurationError::MissingVariable {
                constraint: self.base.name.clone(),
                variable: format!("#{}", self.multiplier.0),
            })
        }
    }

    fn compute_residual(
        &self,
        segment: &MortarSegmentData<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let variable = self.base.variable;
        let nc = ctx.dof_map().num_components(variable);
        for point in self.point_bases(segment) {
            let w = point.weight;
            for c in 0..nc {
                let lambda = ctx
                    .field
                    .interpolate(segment.secondary_nodes, &point.multiplier, self.multiplier, c);
                let u_s = ctx
                    .field
                    .interpolate(segment.secondary_nodes, &point.secondary, variable, c);
                let u_p = ctx
                    .field
                    .interpolate(segment.primary_nodes, &point.primary, variable, c);
                for a in 0..2 {
                    buffer.residual_mut(RowSet::Secondary)[nc * a + c] += w * lambda * point.secondary[a];
                    buffer.residual_mut(RowSet::Primary)[nc * a + c] -= w * lambda * point.primary[a];
                    buffer.residual_mut(RowSet::Lower)[nc * a + c] += w * point.multiplier[a] * (u_s - u_p);
                }
            }
        }
        Ok(())
    }

    fn compute_jacobian(
        &self,
        segment: &MortarSegmentData<T>,
        ctx: &EvaluationContext<T>,
        buffer: &mut LocalContributionBuffer<T>,
    ) -> Result<(), EvaluationError> {
        let nc = ctx.dof_map().num_components(self.base.variable);
        for point in self.point_bases(segment) {
            let w = point.weight;
            for a in 0..2 {
                for b in 0..2 {
                    let secondary = w * point.secondary[a] * point.multiplier[b];
                    let primary = w * point.primary[a] * point.multiplier[b];
                    for c in 0..nc {
                        let (row, col) = (nc * a + c, nc * b + c);
                        buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Lower)[(row, col)] += secondary;
                        buffer.jacobian_mut(RowSet::Primary, ColumnSet::Lower)[(row, col)] -= primary;
                        buffer.jacobian_mut(RowSet::Lower, ColumnSet::Secondary)[(col, row)] += secondary;
                        buffer.jacobian_mut(RowSet::Lower, ColumnSet::Primary)[(col, row)] -= primary;
                    }
                }
            }
        }
        Ok(())
    }
}
