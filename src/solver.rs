//! The nonlinear driver interface and a reference Newton solver.
use crate::error::Outcome;
use crate::Real;
use eyre::eyre;
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};

/// A nonlinear system `r(u) = 0` as seen by a driver.
///
/// Evaluations may reject the iterate with [`Outcome::RetryWithSmallerStep`], which a driver must
/// pass on to its caller instead of treating it as an error.
pub trait NonlinearSystem<T: Real> {
    fn num_dofs(&self) -> usize;

    fn compute_residual(&mut self, solution: &DVector<T>) -> eyre::Result<Outcome<()>>;

    /// The residual of the last call to [`compute_residual`](Self::compute_residual).
    fn residual(&self) -> &DVector<T>;

    fn compute_jacobian(&mut self, solution: &DVector<T>) -> eyre::Result<Outcome<()>>;

    /// The Jacobian of the last call to [`compute_jacobian`](Self::compute_jacobian).
    fn jacobian(&self) -> &CsrMatrix<T>;

    /// The fraction of `update` that should be applied to `solution`.
    fn damping_factor(&mut self, _solution: &DVector<T>, _update: &DVector<T>) -> eyre::Result<Outcome<T>> {
        Ok(Outcome::Accepted(T::one()))
    }
}

/// Convergence of an iteration as judged by a system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    Converged,
    NotConverged,
    Diverged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport<T> {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: T,
}

/// Solves a nonlinear system, starting from the values in `solution`.
pub trait NonlinearDriver<T: Real> {
    fn solve<S>(&self, system: &mut S, solution: &mut DVector<T>) -> eyre::Result<Outcome<SolveReport<T>>>
    where
        S: NonlinearSystem<T> + ?Sized;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    pub max_iterations: usize,
    /// The iterate is rejected once the residual norm grows beyond this multiple of the initial
    /// norm.
    pub divergence_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            absolute_tolerance: 1e-10,
            relative_tolerance: 1e-8,
            max_iterations: 25,
            divergence_tolerance: 1e8,
        }
    }
}

/// Newton's method with a dense LU factorization of the Jacobian.
///
/// Intended for the small systems of tests and examples.
#[derive(Debug, Clone, Default)]
pub struct NewtonSolver {
    pub settings: NewtonSettings,
}

impl NewtonSolver {
    pub fn new(settings: NewtonSettings) -> Self {
        Self { settings }
    }
}

macro_rules! accepted_or_return {
    ($outcome:expr) => {
        match $outcome {
            Outcome::Accepted(value) => value,
            Outcome::RetryWithSmallerStep { reason } => return Ok(Outcome::RetryWithSmallerStep { reason }),
        }
    };
}

impl<T: Real> NonlinearDriver<T> for NewtonSolver {
    fn solve<S>(&self, system: &mut S, solution: &mut DVector<T>) -> eyre::Result<Outcome<SolveReport<T>>>
    where
        S: NonlinearSystem<T> + ?Sized,
    {
        let settings = &self.settings;
        let absolute_tolerance = T::from_f64(settings.absolute_tolerance).unwrap();
        let relative_tolerance = T::from_f64(settings.relative_tolerance).unwrap();
        let divergence_tolerance = T::from_f64(settings.divergence_tolerance).unwrap();
        let mut initial_norm = T::zero();

        for iteration in 0..=settings.max_iterations {
            accepted_or_return!(system.compute_residual(solution)?);
            let norm = system.residual().norm();
            if iteration == 0 {
                initial_norm = norm;
            }
            debug!("Newton iteration {iteration}: |r| = {norm:?}");

            if !norm.is_finite() || norm > divergence_tolerance * initial_norm.max(absolute_tolerance) {
                return Ok(Outcome::RetryWithSmallerStep {
                    reason: format!("Newton iteration diverged at iteration {iteration} (|r| = {norm:?})"),
                });
            }
            if norm <= absolute_tolerance || norm <= relative_tolerance * initial_norm {
                info!("Newton converged in {iteration} iterations (|r| = {norm:?})");
                return Ok(Outcome::Accepted(SolveReport {
                    converged: true,
                    iterations: iteration,
                    residual_norm: norm,
                }));
            }
            if iteration == settings.max_iterations {
                info!("Newton did not converge in {iteration} iterations (|r| = {norm:?})");
                return Ok(Outcome::Accepted(SolveReport {
                    converged: false,
                    iterations: iteration,
                    residual_norm: norm,
                }));
            }

            accepted_or_return!(system.compute_jacobian(solution)?);
            let jacobian = DMatrix::from(system.jacobian());
            let rhs = -system.residual();
            let update = match jacobian.lu().solve(&rhs) {
                Some(update) => update,
                None => {
                    return Ok(Outcome::RetryWithSmallerStep {
                        reason: format!("singular Jacobian at Newton iteration {iteration}"),
                    })
                }
            };
            let factor = accepted_or_return!(system.damping_factor(solution, &update)?);
            solution.axpy(factor, &update, T::one());
        }
        Err(eyre!("Newton loop exited without a result"))
    }
}
