use matrixcompare::assert_scalar_eq;
use mortise::augmented::{AugmentedIterationController, AugmentedSettings, AugmentedState, AugmentedSystem};
use mortise::error::Outcome;
use mortise::nalgebra_sparse::CsrMatrix;
use mortise::solver::{ConvergenceStatus, NewtonSettings, NewtonSolver, NonlinearDriver, NonlinearSystem};
use nalgebra::{dvector, DVector};

fn scalar_matrix(value: f64) -> CsrMatrix<f64> {
    CsrMatrix::try_from_csr_data(1, 1, vec![0, 1], vec![0], vec![value]).unwrap()
}

/// `r(u) = u^3 - 8`, optionally rejecting iterates beyond a bound.
struct Cubic {
    residual: DVector<f64>,
    jacobian: CsrMatrix<f64>,
    reject_above: Option<f64>,
}

impl Cubic {
    fn new() -> Self {
        Self {
            residual: dvector![0.0],
            jacobian: scalar_matrix(1.0),
            reject_above: None,
        }
    }
}

impl NonlinearSystem<f64> for Cubic {
    fn num_dofs(&self) -> usize {
        1
    }

    fn compute_residual(&mut self, solution: &DVector<f64>) -> eyre::Result<Outcome<()>> {
        let u = solution[0];
        if self.reject_above.map_or(false, |bound| u > bound) {
            return Ok(Outcome::RetryWithSmallerStep {
                reason: format!("u = {u} is out of bounds"),
            });
        }
        self.residual = dvector![u * u * u - 8.0];
        Ok(Outcome::Accepted(()))
    }

    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    fn compute_jacobian(&mut self, solution: &DVector<f64>) -> eyre::Result<Outcome<()>> {
        self.jacobian = scalar_matrix(3.0 * solution[0] * solution[0]);
        Ok(Outcome::Accepted(()))
    }

    fn jacobian(&self) -> &CsrMatrix<f64> {
        &self.jacobian
    }
}

/// `r(u) = u - target`, where every multiplier update moves the target by one.
struct MovingTarget {
    target: f64,
    updates: usize,
    updates_needed: usize,
    diverge: bool,
    residual: DVector<f64>,
    jacobian: CsrMatrix<f64>,
}

impl MovingTarget {
    fn new(updates_needed: usize) -> Self {
        Self {
            target: 0.0,
            updates: 0,
            updates_needed,
            diverge: false,
            residual: dvector![0.0],
            jacobian: scalar_matrix(1.0),
        }
    }
}

impl NonlinearSystem<f64> for MovingTarget {
    fn num_dofs(&self) -> usize {
        1
    }

    fn compute_residual(&mut self, solution: &DVector<f64>) -> eyre::Result<Outcome<()>> {
        self.residual = dvector![solution[0] - self.target];
        Ok(Outcome::Accepted(()))
    }

    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    fn compute_jacobian(&mut self, _solution: &DVector<f64>) -> eyre::Result<Outcome<()>> {
        Ok(Outcome::Accepted(()))
    }

    fn jacobian(&self) -> &CsrMatrix<f64> {
        &self.jacobian
    }
}

impl AugmentedSystem<f64> for MovingTarget {
    fn has_augmented_constraints(&self) -> bool {
        true
    }

    fn check_outer_convergence(&mut self) -> ConvergenceStatus {
        if self.diverge {
            ConvergenceStatus::Diverged
        } else if self.updates >= self.updates_needed {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::NotConverged
        }
    }

    fn update_augmented_multipliers(&mut self) {
        self.updates += 1;
        self.target += 1.0;
    }
}

#[test]
fn newton_converges_quadratically_on_cubic() {
    let mut system = Cubic::new();
    let mut u = dvector![1.0];
    let report = NewtonSolver::default()
        .solve(&mut system, &mut u)
        .unwrap()
        .unwrap_accepted();
    assert!(report.converged);
    assert!(report.iterations > 2 && report.iterations < 10);
    assert_scalar_eq!(u[0], 2.0, comp = abs, tol = 1e-10);
}

#[test]
fn newton_reports_failure_to_converge() {
    let mut system = Cubic::new();
    let mut u = dvector![1.0];
    let solver = NewtonSolver::new(NewtonSettings {
        max_iterations: 1,
        ..NewtonSettings::default()
    });
    let report = solver.solve(&mut system, &mut u).unwrap().unwrap_accepted();
    assert!(!report.converged);
    assert_eq!(report.iterations, 1);
}

#[test]
fn newton_passes_on_rejected_iterates() {
    // The first Newton step from u = 1 overshoots to u = 10 / 3
    let mut system = Cubic::new();
    system.reject_above = Some(3.0);
    let mut u = dvector![1.0];
    let outcome = NewtonSolver::default().solve(&mut system, &mut u).unwrap();
    assert!(matches!(outcome, Outcome::RetryWithSmallerStep { .. }));
}

#[test]
fn augmented_iteration_repeats_solve_until_constraints_converge() {
    let mut system = MovingTarget::new(3);
    let mut controller = AugmentedIterationController::new(NewtonSolver::default(), AugmentedSettings::default());
    assert_eq!(controller.state(), AugmentedState::NotConverged);
    let mut u = dvector![0.5];
    let report = controller
        .solve_step(&mut system, &mut u)
        .unwrap()
        .unwrap_accepted();
    assert_eq!(report.outer_iterations, 3);
    assert_eq!(controller.state(), AugmentedState::Converged);
    assert_scalar_eq!(u[0], 3.0, comp = abs, tol = 1e-12);
}

#[test]
fn diverging_constraints_request_smaller_step() {
    let mut system = MovingTarget::new(3);
    system.diverge = true;
    let mut controller = AugmentedIterationController::new(NewtonSolver::default(), AugmentedSettings::default());
    let mut u = dvector![0.0];
    let outcome = controller.solve_step(&mut system, &mut u).unwrap();
    assert!(matches!(outcome, Outcome::RetryWithSmallerStep { .. }));
    assert_eq!(controller.state(), AugmentedState::NotConverged);
    assert_eq!(system.updates, 0);
}

#[test]
fn exceeding_outer_iteration_cap_is_an_error() {
    let mut system = MovingTarget::new(100);
    let settings = AugmentedSettings { max_outer_iterations: 2 };
    let mut controller = AugmentedIterationController::new(NewtonSolver::default(), settings);
    let mut u = dvector![0.0];
    assert!(controller.solve_step(&mut system, &mut u).is_err());
    assert_eq!(system.updates, 2);
}
