use crate::integration_tests::{
    block_on_square, conduction_across_squares, contact_settings, pressed_block, solve_step, squares_side_by_side,
    BLOCK_LEFT, SQUARE_RIGHT,
};
use eyre::eyre;
use matrixcompare::assert_matrix_eq;
use mortise::assembly::LocalContributionBuffer;
use mortise::constraint::{
    ApplyDecision, Constraint, ConstraintBase, ContactFormulation, EqualValueMortarConstraint, EvaluationContext,
    InteractionKey, NodeFaceConstraint, TiedValueConstraint,
};
use mortise::dof::{VariableId, VariableSupport};
use mortise::error::{EvaluationError, Outcome};
use mortise::mesh::MeshQuery;
use mortise::parallel::{run_on_threads, Communicator, SerialCommunicator};
use mortise::search::{ProjectionInfo, SearchSettings};
use mortise::solver::NonlinearSystem;
use mortise::system::ConstraintSystem;
use nalgebra::DVector;

const NUM_PROCESSORS: usize = 3;

const INTERFACE: InteractionKey = InteractionKey::BoundaryPair {
    secondary: BLOCK_LEFT,
    primary: SQUARE_RIGHT,
};

fn tied_squares<C: Communicator>(comm: C) -> ConstraintSystem<f64, C> {
    let mut mesh = squares_side_by_side(3);
    mesh.partition_contiguous(comm.size());
    let (mut system, u) = conduction_across_squares(mesh, comm, |_, _| {});
    let base = ConstraintBase::new("tie", INTERFACE, u);
    system
        .add_constraint(Constraint::node_face(TiedValueConstraint::new(base)))
        .unwrap();
    system.initialize().unwrap();
    system
}

fn mortar_squares<C: Communicator>(comm: C) -> ConstraintSystem<f64, C> {
    let mut mesh = squares_side_by_side(3);
    mesh.partition_contiguous(comm.size());
    let secondary_nodes = mesh.boundary_nodes(BLOCK_LEFT);
    let mut multiplier = VariableId(0);
    let (mut system, u) = conduction_across_squares(mesh, comm, |_, builder| {
        multiplier = builder.add_variable("lambda", 1, VariableSupport::Nodes(secondary_nodes));
    });
    let base = ConstraintBase::new("mortar", INTERFACE, u);
    system
        .add_constraint(Constraint::mortar(EqualValueMortarConstraint::new(base, multiplier)))
        .unwrap();
    system.initialize().unwrap();
    system
}

#[test]
fn distributed_contact_matches_serial_solution() {
    let settings = contact_settings(ContactFormulation::Kinematic, 1000.0);
    let mut serial = pressed_block(block_on_square(), SerialCommunicator, settings.clone()).unwrap();
    let (expected, _) = solve_step(&mut serial);

    let solutions = run_on_threads(NUM_PROCESSORS, |comm| {
        let mut mesh = block_on_square();
        mesh.partition_contiguous(NUM_PROCESSORS);
        let mut system = pressed_block(mesh, comm, settings.clone()).unwrap();
        let (u, _) = solve_step(&mut system);
        let captured = system
            .projection_locator("contact")
            .unwrap()
            .infos()
            .filter(|info| info.captured)
            .count();
        (u, captured)
    });
    for (u, captured) in solutions {
        assert_eq!(captured, 4);
        assert_matrix_eq!(u, expected, comp = abs, tol = 1e-9);
    }
}

#[test]
fn distributed_tying_matches_serial_solution() {
    let mut serial = tied_squares(SerialCommunicator);
    let (expected, _) = solve_step(&mut serial);

    let solutions = run_on_threads(NUM_PROCESSORS, |comm| {
        let mut system = tied_squares(comm);
        let (mut u, report) = solve_step(&mut system);
        // Every processor ends up with the same prescribed secondary values
        u.iter_mut().for_each(|value| *value += 1.0);
        system.apply_secondary_values(&mut u).unwrap();
        (u, report.iterations)
    });
    let (first, iterations) = solutions[0].clone();
    for (u, other_iterations) in solutions {
        assert_eq!(other_iterations, iterations);
        assert_matrix_eq!(u, first, comp = abs, tol = 0.0);
    }

    let mut shifted = expected;
    shifted.iter_mut().for_each(|value| *value += 1.0);
    serial.apply_secondary_values(&mut shifted).unwrap();
    assert_matrix_eq!(first, shifted, comp = abs, tol = 1e-12);
}

#[test]
fn distributed_mortar_matches_serial_solution() {
    let mut serial = mortar_squares(SerialCommunicator);
    let (expected, _) = solve_step(&mut serial);

    let solutions: Vec<DVector<f64>> = run_on_threads(NUM_PROCESSORS, |comm| {
        let mut system = mortar_squares(comm);
        solve_step(&mut system).0
    });
    for u in solutions {
        assert_matrix_eq!(u, expected, comp = abs, tol = 1e-10);
    }
}

/// Fails while evaluating the residual at a single secondary node.
struct FailingConstraint {
    base: ConstraintBase<f64>,
    search: SearchSettings,
    failing_node: usize,
    fatal: bool,
}

impl NodeFaceConstraint<f64> for FailingConstraint {
    fn base(&self) -> &ConstraintBase<f64> {
        &self.base
    }

    fn search_settings(&self) -> &SearchSettings {
        &self.search
    }

    fn should_apply(&self, _info: &ProjectionInfo<f64>, _ctx: &EvaluationContext<f64>) -> ApplyDecision {
        ApplyDecision::apply()
    }

    fn compute_residual(
        &self,
        info: &ProjectionInfo<f64>,
        _ctx: &EvaluationContext<f64>,
        _buffer: &mut LocalContributionBuffer<f64>,
    ) -> Result<(), EvaluationError> {
        let node = info.secondary_node;
        match (node == self.failing_node, self.fatal) {
            (false, _) => Ok(()),
            (true, true) => Err(EvaluationError::Fatal(eyre!("invalid state at node {node}"))),
            (true, false) => Err(EvaluationError::RetryWithSmallerStep(format!("node {node} moved too far"))),
        }
    }

    fn compute_jacobian(
        &self,
        _info: &ProjectionInfo<f64>,
        _ctx: &EvaluationContext<f64>,
        _buffer: &mut LocalContributionBuffer<f64>,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// Two processors, with a constraint that fails only on the owner of the lowest secondary node.
///
/// Returns, for every processor, its rank, the failing rank, the residual result and whether the
/// following Jacobian evaluation was accepted.
fn evaluate_failing_squares(fatal: bool) -> Vec<(usize, usize, eyre::Result<Outcome<()>>, bool)> {
    run_on_threads(2, |comm| {
        let rank = comm.rank();
        let mut mesh = squares_side_by_side(3);
        mesh.partition_contiguous(comm.size());
        let failing_node = mesh.boundary_nodes(BLOCK_LEFT)[0];
        let owner = mesh.node_owner(failing_node);
        let (mut system, u) = conduction_across_squares(mesh, comm, |_, _| {});
        let constraint = FailingConstraint {
            base: ConstraintBase::new("failing", INTERFACE, u),
            search: SearchSettings::default(),
            failing_node,
            fatal,
        };
        system.add_constraint(Constraint::node_face(constraint)).unwrap();
        system.initialize().unwrap();

        let u = DVector::zeros(system.num_dofs());
        system.set_time(1.0, 1.0);
        system.begin_step(true, &u);
        let residual = system.compute_residual(&u);
        // All processors left the failed pass together and can take part in the next one
        let jacobian = system.compute_jacobian(&u).unwrap();
        (rank, owner, residual, jacobian.is_accepted())
    })
}

#[test]
fn fatal_error_on_one_processor_fails_all_processors() {
    let results = evaluate_failing_squares(true);
    assert_eq!(results.len(), 2);
    for (rank, owner, residual, jacobian_accepted) in results {
        let message = format!("{:#}", residual.unwrap_err());
        assert!(message.contains("invalid state at node"), "{message}");
        if rank != owner {
            assert!(message.contains(&format!("processor {owner}")), "{message}");
        }
        assert!(jacobian_accepted);
    }
}

#[test]
fn rejected_iterate_on_one_processor_is_rejected_everywhere() {
    let results = evaluate_failing_squares(false);
    for (rank, owner, residual, jacobian_accepted) in results {
        let Outcome::RetryWithSmallerStep { reason } = residual.unwrap() else {
            panic!("processor {rank} accepted an iterate rejected on processor {owner}");
        };
        if rank == owner {
            assert!(reason.contains("moved too far"), "{reason}");
        } else {
            assert!(reason.contains("another processor"), "{reason}");
        }
        assert!(jacobian_accepted);
    }
}
