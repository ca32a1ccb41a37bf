//! Outer iteration for augmented Lagrange constraints.
//!
//! The inner nonlinear solve is repeated with updated multipliers until every augmented
//! constraint reports convergence, or the outer iteration cap is exceeded.
use crate::error::Outcome;
use crate::solver::{ConvergenceStatus, NonlinearDriver, NonlinearSystem, SolveReport};
use crate::Real;
use eyre::bail;
use log::info;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// A system whose constraints need an outer multiplier iteration.
pub trait AugmentedSystem<T: Real>: NonlinearSystem<T> {
    fn has_augmented_constraints(&self) -> bool;

    fn check_outer_convergence(&mut self) -> ConvergenceStatus;

    fn update_augmented_multipliers(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentedState {
    NotConverged,
    CheckingConstraintConvergence,
    Converged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentedSettings {
    pub max_outer_iterations: usize,
}

impl Default for AugmentedSettings {
    fn default() -> Self {
        Self {
            max_outer_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedReport<T> {
    /// Number of multiplier updates that were needed.
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub last_solve: SolveReport<T>,
}

/// Drives the inner solve and the multiplier updates of one time step.
#[derive(Debug, Clone)]
pub struct AugmentedIterationController<D> {
    driver: D,
    settings: AugmentedSettings,
    state: AugmentedState,
}

impl<D> AugmentedIterationController<D> {
    pub fn new(driver: D, settings: AugmentedSettings) -> Self {
        Self {
            driver,
            settings,
            state: AugmentedState::NotConverged,
        }
    }

    pub fn state(&self) -> AugmentedState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Solves one step.
    ///
    /// A failed inner solve, or diverging constraints, are reported as a request for a smaller
    /// step. Exceeding the outer iteration cap is an error.
    pub fn solve_step<T, S>(
        &mut self,
        system: &mut S,
        solution: &mut DVector<T>,
    ) -> eyre::Result<Outcome<AugmentedReport<T>>>
    where
        T: Real,
        D: NonlinearDriver<T>,
        S: AugmentedSystem<T> + ?Sized,
    {
        self.state = AugmentedState::NotConverged;
        let mut outer_iterations = 0;
        let mut inner_iterations = 0;
        loop {
            let report = match self.driver.solve(system, solution)? {
                Outcome::Accepted(report) => report,
                Outcome::RetryWithSmallerStep { reason } => return Ok(Outcome::RetryWithSmallerStep { reason }),
            };
            inner_iterations += report.iterations;
            if !report.converged {
                return Ok(Outcome::RetryWithSmallerStep {
                    reason: format!("nonlinear solve did not converge (|r| = {:?})", report.residual_norm),
                });
            }

            self.state = AugmentedState::CheckingConstraintConvergence;
            let status = if system.has_augmented_constraints() {
                system.check_outer_convergence()
            } else {
                ConvergenceStatus::Converged
            };
            match status {
                ConvergenceStatus::Converged => {
                    self.state = AugmentedState::Converged;
                    info!("Augmented iteration converged after {outer_iterations} multiplier updates");
                    return Ok(Outcome::Accepted(AugmentedReport {
                        outer_iterations,
                        inner_iterations,
                        last_solve: report,
                    }));
                }
                ConvergenceStatus::Diverged => {
                    self.state = AugmentedState::NotConverged;
                    return Ok(Outcome::RetryWithSmallerStep {
                        reason: "augmented Lagrange constraints diverged".to_string(),
                    });
                }
                ConvergenceStatus::NotConverged => {}
            }

            if outer_iterations >= self.settings.max_outer_iterations {
                bail!(
                    "augmented Lagrange iteration did not converge within {} outer iterations",
                    self.settings.max_outer_iterations
                );
            }
            system.update_augmented_multipliers();
            outer_iterations += 1;
            self.state = AugmentedState::NotConverged;
            info!("Augmented iteration {outer_iterations}: multipliers updated, repeating the inner solve");
        }
    }
}
