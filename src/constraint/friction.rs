use crate::error::EvaluationError;
use crate::Real;
use serde::{Deserialize, Serialize};

/// Coulomb friction parameters.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrictionSettings {
    pub coefficient: f64,
    /// Penalty on tangential slip while sticking. Defaults to the normal penalty.
    pub tangential_penalty: Option<f64>,
}

impl Default for FrictionSettings {
    fn default() -> Self {
        Self {
            coefficient: 0.0,
            tangential_penalty: None,
        }
    }
}

/// Limits on how far frictional nodes may slip within one nonlinear update.
///
/// Newton iterations on frictional contact tend to oscillate between slip directions. The damper
/// scales the update so that no node sliding against friction reverses an established slip
/// direction by more than a threshold, and no such node slips farther than `max_iterative_slip`
/// in a single update. Sticking nodes are never damped.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipDamperSettings {
    pub max_iterative_slip: f64,
    /// Updates damped below this factor are rejected, and the step is retried with a smaller size.
    pub min_damping_factor: f64,
    /// A reversal is damped if the new slip exceeds this fraction of the current slip.
    pub reversal_threshold: f64,
    /// Slips of at most this magnitude have no direction.
    pub slip_tolerance: f64,
}

impl Default for SlipDamperSettings {
    fn default() -> Self {
        Self {
            max_iterative_slip: 1e-3,
            min_damping_factor: 1e-3,
            reversal_threshold: 0.0,
            slip_tolerance: 1e-8,
        }
    }
}

impl SlipDamperSettings {
    /// The damping factor in `(0, 1]` for a slipping node.
    ///
    /// `previous_iteration` and `current` are the incremental slips at the previous and the current
    /// iterate, `trial` the incremental slip under the full update. A slip direction is
    /// established once the node slipped the same way at both iterates.
    pub fn node_factor<T: Real>(&self, previous_iteration: T, current: T, trial: T) -> T {
        let delta = (trial - current).abs();
        if delta == T::zero() {
            return T::one();
        }
        let mut factor = T::one();
        let tolerance = T::from_f64(self.slip_tolerance).unwrap();
        let threshold = T::from_f64(self.reversal_threshold).unwrap();
        let established = previous_iteration * current > T::zero()
            && previous_iteration.abs() > tolerance
            && current.abs() > tolerance;
        let reverses = current * trial < T::zero() && trial.abs() > tolerance.max(threshold * current.abs());
        if established && reverses {
            // Stop the node where its slip changes sign
            factor = factor.min(current.abs() / delta);
        }
        let max_slip = T::from_f64(self.max_iterative_slip).unwrap();
        if delta > max_slip {
            factor = factor.min(max_slip / delta);
        }
        factor
    }

    /// Checks a combined damping factor against the lower limit.
    pub fn accept<T: Real>(&self, factor: T) -> Result<T, EvaluationError> {
        let min_factor = T::from_f64(self.min_damping_factor).unwrap();
        if factor < min_factor {
            Err(EvaluationError::RetryWithSmallerStep(format!(
                "slip damping factor {factor:?} is below the minimum {min_factor:?}"
            )))
        } else {
            Ok(factor)
        }
    }
}
