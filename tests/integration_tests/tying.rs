use crate::integration_tests::{
    conduction_across_squares, solve_step, squares_side_by_side, BLOCK_LEFT, SQUARE_LEFT, SQUARE_RIGHT,
};
use matrixcompare::assert_scalar_eq;
use mortise::assembly::{ColumnSet, LocalContributionBuffer, RowSet};
use mortise::constraint::{
    Constraint, ConstraintBase, EqualValueMortarConstraint, EqualValueNodeElemConstraint, EvaluationContext,
    GapConductanceConstraint, InteractionKey, InterfacePenaltyConstraint, MortarBasis, NodalPenaltyConstraint,
    NodeElemConstraint, TiedValueConstraint,
};
use mortise::dof::{DofMapBuilder, VariableId, VariableSupport};
use mortise::error::EvaluationError;
use mortise::geometry::populate_segment_basis;
use mortise::kernels::{DiffusionKernel, DirichletBc};
use mortise::mesh::procedural::{create_rectangular_quad_mesh, RectangleTags};
use mortise::mesh::{InterfaceSides, InterfaceTag, Mesh, MeshQuery, SubdomainTag};
use mortise::parallel::{Communicator, SerialCommunicator};
use mortise::search::ElementLocation;
use mortise::solver::NonlinearSystem;
use mortise::system::ConstraintSystem;
use nalgebra::{point, vector, DVector};

const INTERFACE: InteractionKey = InteractionKey::BoundaryPair {
    secondary: BLOCK_LEFT,
    primary: SQUARE_RIGHT,
};

/// Asserts that the solution is the linear profile `u = x / 2` at every node.
fn assert_linear_profile(system: &ConstraintSystem<f64, impl Communicator>, u: &DVector<f64>, variable: VariableId, tol: f64) {
    for (node, x) in system.mesh().vertices().iter().enumerate() {
        let dof = system.dof_map().dof_index(node, variable, 0).unwrap();
        assert_scalar_eq!(u[dof], x.x / 2.0, comp = abs, tol = tol);
    }
}

/// Pairs of coincident nodes on the secondary and primary side of the interface.
fn coincident_interface_nodes(mesh: &Mesh<f64>) -> Vec<(usize, usize)> {
    let primary = mesh.boundary_nodes(SQUARE_RIGHT);
    mesh.boundary_nodes(BLOCK_LEFT)
        .into_iter()
        .map(|s| {
            let p = primary
                .iter()
                .copied()
                .find(|&p| (mesh.vertices()[p] - mesh.vertices()[s]).norm() < 1e-12)
                .expect("meshes should match at the interface");
            (s, p)
        })
        .collect()
}

#[test]
fn tied_surfaces_carry_linear_profile_across_non_matching_interface() {
    let (mut system, u_var) = conduction_across_squares(squares_side_by_side(3), SerialCommunicator, |_, _| {});
    let base = ConstraintBase::new("tie", INTERFACE, u_var);
    system
        .add_constraint(Constraint::node_face(TiedValueConstraint::new(base)))
        .unwrap();
    system.initialize().unwrap();

    let (mut u, _) = solve_step(&mut system);
    assert_linear_profile(&system, &u, u_var, 1e-10);

    // Prescribing secondary values reproduces the interpolated primary values
    let secondary_nodes = system.mesh().boundary_nodes(BLOCK_LEFT);
    for &node in &secondary_nodes {
        u[system.dof_map().dof_index(node, u_var, 0).unwrap()] = 7.0;
    }
    system.apply_secondary_values(&mut u).unwrap();
    assert_linear_profile(&system, &u, u_var, 1e-10);
}

#[test]
fn mortar_tying_satisfies_weak_continuity() {
    let mesh = squares_side_by_side(3);
    let secondary_nodes = mesh.boundary_nodes(BLOCK_LEFT);
    let mut multiplier = VariableId(0);
    let (mut system, u_var) = conduction_across_squares(mesh, SerialCommunicator, |_, builder| {
        multiplier = builder.add_variable("lambda", 1, VariableSupport::Nodes(secondary_nodes.clone()));
    });
    let base = ConstraintBase::new("mortar", INTERFACE, u_var);
    system
        .add_constraint(Constraint::mortar(EqualValueMortarConstraint::new(base, multiplier)))
        .unwrap();
    system.initialize().unwrap();

    let (u, _) = solve_step(&mut system);
    assert_linear_profile(&system, &u, u_var, 1e-10);

    // Both traces agree at every quadrature point of the segment mesh
    let segments = system.mortar_segments("mortar").unwrap();
    let positions = system.mesh().vertices();
    let value = |nodes: &[usize], xi: f64| {
        let mut basis = [0.0; 2];
        populate_segment_basis(&mut basis, xi);
        nodes
            .iter()
            .zip(basis)
            .map(|(&node, n)| n * u[system.dof_map().dof_index(node, u_var, 0).unwrap()])
            .sum::<f64>()
    };
    for segment in segments.segments() {
        let secondary = segments.secondary_side_nodes(segment.secondary_side);
        let primary = segments.primary_side_nodes(segment.primary_side);
        for qp in segments.quadrature_points(segment, positions, 2) {
            assert_scalar_eq!(value(secondary, qp.secondary_xi), value(primary, qp.primary_xi), comp = abs, tol = 1e-10);
        }
    }

    // The multiplier is the flux density through the interface
    for &node in &secondary_nodes {
        let lambda = u[system.dof_map().dof_index(node, multiplier, 0).unwrap()];
        assert_scalar_eq!(lambda, 0.5, comp = abs, tol = 1e-10);
    }
}

#[test]
fn dual_mortar_coupling_is_diagonal() {
    let mesh = squares_side_by_side(3);
    let secondary_nodes = mesh.boundary_nodes(BLOCK_LEFT);
    let mut multiplier = VariableId(0);
    let (mut system, u_var) = conduction_across_squares(mesh, SerialCommunicator, |_, builder| {
        multiplier = builder.add_variable("lambda", 1, VariableSupport::Nodes(secondary_nodes.clone()));
    });
    let base = ConstraintBase::new("mortar", INTERFACE, u_var);
    let mortar = EqualValueMortarConstraint::new(base, multiplier).with_basis(MortarBasis::Dual);
    system.add_constraint(Constraint::mortar(mortar)).unwrap();
    system.initialize().unwrap();

    let (u, _) = solve_step(&mut system);
    assert_linear_profile(&system, &u, u_var, 1e-10);

    let jacobian = system.global_jacobian();
    let dof_map = system.dof_map();
    for &i in &secondary_nodes {
        let row = dof_map.dof_index(i, multiplier, 0).unwrap();
        for &j in &secondary_nodes {
            let col = dof_map.dof_index(j, u_var, 0).unwrap();
            let entry = jacobian.get(row, col);
            if i == j {
                assert!(entry > 0.0);
            } else {
                assert_scalar_eq!(entry, 0.0, comp = abs, tol = 1e-12);
            }
        }
    }
}

#[test]
fn dual_mortar_falls_back_to_standard_basis_on_partially_covered_sides() {
    // The right square raised by half its height, so the primary surface ends at y = 1 in the
    // middle of a secondary side
    let mut mesh = create_rectangular_quad_mesh(
        &point![0.0, 0.0],
        &vector![1.0, 1.0],
        [2, 2],
        SubdomainTag(0),
        RectangleTags::consecutive(0),
    );
    let raised = create_rectangular_quad_mesh(
        &point![1.0, 0.5],
        &vector![1.0, 1.0],
        [3, 3],
        SubdomainTag(1),
        RectangleTags::consecutive(4),
    );
    mesh.append(&raised);
    let secondary_nodes = mesh.boundary_nodes(BLOCK_LEFT);
    let node_at = |mesh: &Mesh<f64>, y: f64| {
        secondary_nodes
            .iter()
            .copied()
            .find(|&n| (mesh.vertices()[n].y - y).abs() < 1e-12)
            .unwrap()
    };
    let (below, above) = (node_at(&mesh, 0.5 + 1.0 / 3.0), node_at(&mesh, 0.5 + 2.0 / 3.0));
    let mut multiplier = VariableId(0);
    let (mut system, u_var) = conduction_across_squares(mesh, SerialCommunicator, |_, builder| {
        multiplier = builder.add_variable("lambda", 1, VariableSupport::Nodes(secondary_nodes.clone()));
    });
    let base = ConstraintBase::new("mortar", INTERFACE, u_var);
    let mortar = EqualValueMortarConstraint::new(base, multiplier).with_basis(MortarBasis::Dual);
    system.add_constraint(Constraint::mortar(mortar)).unwrap();
    system.initialize().unwrap();

    let u = DVector::zeros(system.num_dofs());
    system.set_time(1.0, 1.0);
    system.begin_step(true, &u);
    system.compute_jacobian(&u).unwrap().unwrap_accepted();

    // Over the covered lower half of the side between the two nodes, the dual function of the
    // upper node integrates to -1/4 against the lower node's shape function and the standard
    // one to 1/6, times the half length of the side
    let dof_map = system.dof_map();
    let row = dof_map.dof_index(above, multiplier, 0).unwrap();
    let col = dof_map.dof_index(below, u_var, 0).unwrap();
    let half_length = 1.0 / 6.0;
    assert_scalar_eq!(system.global_jacobian().get(row, col), half_length / 6.0, comp = abs, tol = 1e-12);
}

/// A host spanning `[0, 3] x [0, 1]` (tags 0 to 3, subdomain 0) with an embedded block
/// `[1.2, 1.8] x [0.2, 0.8]` (tags 4 to 7, subdomain 1).
fn embedded_block() -> Mesh<f64> {
    let mut mesh = create_rectangular_quad_mesh(
        &point![0.0, 0.0],
        &vector![3.0, 1.0],
        [6, 2],
        SubdomainTag(0),
        RectangleTags::consecutive(0),
    );
    let embedded = create_rectangular_quad_mesh(
        &point![1.2, 0.2],
        &vector![0.6, 0.6],
        [2, 2],
        SubdomainTag(1),
        RectangleTags::consecutive(4),
    );
    mesh.append(&embedded);
    mesh
}

const EMBEDDING: InteractionKey = InteractionKey::SubdomainPair {
    secondary: SubdomainTag(1),
    primary: SubdomainTag(0),
};

#[test]
fn embedded_subdomain_follows_host_field() {
    let mesh = embedded_block();
    let mut builder = DofMapBuilder::new();
    let u_var = builder.add_variable("u", 1, VariableSupport::AllNodes);
    let dof_map = builder.build(&mesh);
    let mut system = ConstraintSystem::new(mesh, dof_map);
    system.add_kernel(DiffusionKernel::new(u_var, 1.0).on_subdomains(vec![SubdomainTag(0)]));
    system.add_dirichlet_bc(DirichletBc::new("cold", u_var, 0, SQUARE_LEFT, 0.0));
    system.add_dirichlet_bc(DirichletBc::new("hot", u_var, 0, SQUARE_RIGHT, 1.0));
    let base = ConstraintBase::new("embed", EMBEDDING, u_var);
    system
        .add_constraint(Constraint::node_elem(EqualValueNodeElemConstraint::new(base)))
        .unwrap();
    system.initialize().unwrap();

    let (u, _) = solve_step(&mut system);
    for (node, x) in system.mesh().vertices().iter().enumerate() {
        let dof = system.dof_map().dof_index(node, u_var, 0).unwrap();
        assert_scalar_eq!(u[dof], x.x / 3.0, comp = abs, tol = 1e-10);
    }
}

#[test]
fn interface_penalty_suppresses_jump() {
    let mut mesh = squares_side_by_side(2);
    mesh.add_interface(
        InterfaceTag(0),
        InterfaceSides {
            secondary: BLOCK_LEFT,
            primary: SQUARE_RIGHT,
        },
    );
    let pairs = coincident_interface_nodes(&mesh);
    let (mut system, u_var) = conduction_across_squares(mesh, SerialCommunicator, |_, _| {});
    let base = ConstraintBase::new("glue", InteractionKey::Interface(InterfaceTag(0)), u_var);
    system
        .add_constraint(Constraint::elem_elem(InterfacePenaltyConstraint::new(base, 1e6)))
        .unwrap();
    system.initialize().unwrap();

    let (u, _) = solve_step(&mut system);
    assert_eq!(pairs.len(), 3);
    for (s, p) in pairs {
        let jump = u[system.dof_map().dof_index(s, u_var, 0).unwrap()] - u[system.dof_map().dof_index(p, u_var, 0).unwrap()];
        assert!(jump.abs() < 1e-5, "jump {jump} at nodes {s} and {p}");
    }
    assert_linear_profile(&system, &u, u_var, 1e-5);
}

#[test]
fn nodal_penalty_couples_nearest_nodes() {
    let mesh = squares_side_by_side(2);
    let pairs = coincident_interface_nodes(&mesh);
    let (mut system, u_var) = conduction_across_squares(mesh, SerialCommunicator, |_, _| {});
    let base = ConstraintBase::new("springs", INTERFACE, u_var);
    let springs = NodalPenaltyConstraint::new(base, 1e6).with_max_distance(1e-6);
    system.add_constraint(Constraint::nodal(springs)).unwrap();
    system.initialize().unwrap();

    let (u, _) = solve_step(&mut system);
    for (s, p) in pairs {
        let jump = u[system.dof_map().dof_index(s, u_var, 0).unwrap()] - u[system.dof_map().dof_index(p, u_var, 0).unwrap()];
        assert!(jump.abs() < 1e-5, "jump {jump} at nodes {s} and {p}");
    }
    assert_linear_profile(&system, &u, u_var, 1e-5);
}

#[test]
fn inactive_constraint_leaves_bodies_uncoupled() {
    let (mut system, u_var) = conduction_across_squares(squares_side_by_side(3), SerialCommunicator, |_, _| {});
    let base = ConstraintBase::new("tie", INTERFACE, u_var).active_between(Some(2.0), None);
    system
        .add_constraint(Constraint::node_face(TiedValueConstraint::new(base)))
        .unwrap();
    system.initialize().unwrap();

    // At t = 1 the tie is inactive, so the left square sees no heat and stays cold
    let (u, _) = solve_step(&mut system);
    for node in system.mesh().boundary_nodes(SQUARE_RIGHT) {
        let dof = system.dof_map().dof_index(node, u_var, 0).unwrap();
        assert_scalar_eq!(u[dof], 0.0, comp = abs, tol = 1e-10);
    }
}

/// Adds `coupling * (v_s - sum_a N_a v_a)` to the `u` row of every embedded node, where `v` is the
/// coupled variable.
struct SourceFromCoupledJump {
    base: ConstraintBase<f64>,
    coupled: VariableId,
    coupling: f64,
}

impl NodeElemConstraint<f64> for SourceFromCoupledJump {
    fn base(&self) -> &ConstraintBase<f64> {
        &self.base
    }

    fn compute_residual(
        &self,
        secondary_node: usize,
        location: &ElementLocation<f64>,
        ctx: &EvaluationContext<f64>,
        buffer: &mut LocalContributionBuffer<f64>,
    ) -> Result<(), EvaluationError> {
        let v_s = ctx.field.nodal_value(secondary_node, self.coupled, 0);
        let v_p = ctx
            .field
            .interpolate(&location.nodes, &location.basis, self.coupled, 0);
        buffer.residual_mut(RowSet::Secondary)[0] += self.coupling * (v_s - v_p);
        Ok(())
    }

    fn compute_jacobian(
        &self,
        _secondary_node: usize,
        _location: &ElementLocation<f64>,
        _ctx: &EvaluationContext<f64>,
        _buffer: &mut LocalContributionBuffer<f64>,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn compute_off_diagonal_jacobian(
        &self,
        _secondary_node: usize,
        location: &ElementLocation<f64>,
        _ctx: &EvaluationContext<f64>,
        coupled: VariableId,
        buffer: &mut LocalContributionBuffer<f64>,
    ) -> Result<(), EvaluationError> {
        assert_eq!(coupled, self.coupled);
        assert_eq!(buffer.column_dofs(ColumnSet::Primary).len(), location.nodes.len());
        buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary)[(0, 0)] += self.coupling;
        let j_sp = buffer.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
        for (a, &n_a) in location.basis.iter().enumerate() {
            j_sp[(0, a)] -= self.coupling * n_a;
        }
        Ok(())
    }
}

#[test]
fn node_elem_off_diagonal_blocks_land_in_coupled_columns() {
    let mesh = embedded_block();
    let mut builder = DofMapBuilder::new();
    let u_var = builder.add_variable("u", 1, VariableSupport::AllNodes);
    let v_var = builder.add_variable("v", 1, VariableSupport::AllNodes);
    let dof_map = builder.build(&mesh);
    let mut system = ConstraintSystem::new(mesh, dof_map);
    system.add_kernel(DiffusionKernel::new(u_var, 1.0));
    system.add_kernel(DiffusionKernel::new(v_var, 1.0));
    let base = ConstraintBase::new("source", EMBEDDING, u_var).with_coupled_variables(vec![v_var]);
    let coupling = 3.0;
    system
        .add_constraint(Constraint::node_elem(SourceFromCoupledJump {
            base,
            coupled: v_var,
            coupling,
        }))
        .unwrap();
    system.initialize().unwrap();

    let u = DVector::zeros(system.num_dofs());
    system.set_time(1.0, 1.0);
    system.begin_step(true, &u);
    system.compute_jacobian(&u).unwrap().unwrap_accepted();

    let jacobian = system.global_jacobian();
    let dof_map = system.dof_map();
    let num_host_elements = 12;
    let embedded_nodes: Vec<usize> = (0..system.mesh().num_nodes())
        .filter(|&node| {
            system
                .mesh()
                .node_elements(node)
                .iter()
                .all(|&e| e >= num_host_elements)
        })
        .collect();
    assert_eq!(embedded_nodes.len(), 9);
    let v_dofs: Vec<usize> = (0..system.mesh().num_nodes())
        .filter_map(|node| dof_map.dof_index(node, v_var, 0))
        .collect();
    for &node in &embedded_nodes {
        let row = dof_map.dof_index(node, u_var, 0).unwrap();
        let own = dof_map.dof_index(node, v_var, 0).unwrap();
        assert_scalar_eq!(jacobian.get(row, own), coupling, comp = abs, tol = 1e-12);
        // The host shape functions sum to one
        let host_sum: f64 = jacobian
            .row_entries(row)
            .filter(|&(col, _)| col != own && v_dofs.contains(&col))
            .map(|(_, value)| value)
            .sum();
        assert_scalar_eq!(host_sum, -coupling, comp = abs, tol = 1e-12);
    }
}

/// The unit square (tags 0 to 3) and a square of 3x3 cells (tags 4 to 7) at a distance of `gap`
/// to its right.
fn squares_with_gap(gap: f64) -> Mesh<f64> {
    let mut mesh = create_rectangular_quad_mesh(
        &point![0.0, 0.0],
        &vector![1.0, 1.0],
        [2, 2],
        SubdomainTag(0),
        RectangleTags::consecutive(0),
    );
    let right = create_rectangular_quad_mesh(
        &point![1.0 + gap, 0.0],
        &vector![1.0, 1.0],
        [3, 3],
        SubdomainTag(1),
        RectangleTags::consecutive(4),
    );
    mesh.append(&right);
    mesh
}

#[test]
fn gap_conductance_jacobian_matches_finite_differences() {
    let gap = 0.05;
    let mesh = squares_with_gap(gap);
    let mut builder = DofMapBuilder::new();
    let temperature = builder.add_variable("temperature", 1, VariableSupport::AllNodes);
    let disp = builder.add_variable("disp", 2, VariableSupport::AllNodes);
    let dof_map = builder.build(&mesh);
    let mut system = ConstraintSystem::new(mesh, dof_map);
    system.set_displacement_variable(disp);
    system.add_kernel(DiffusionKernel::new(temperature, 1.0));
    let base = ConstraintBase::new("gap", INTERFACE, temperature).displaced(true);
    system
        .add_constraint(Constraint::node_face(GapConductanceConstraint::new(base, disp, 1.0)))
        .unwrap();
    system.initialize().unwrap();

    // The right square is hot, the unit square cold
    let mut u = DVector::zeros(system.num_dofs());
    for (node, x) in system.mesh().vertices().iter().enumerate() {
        if x.x > 1.0 + 0.5 * gap {
            u[system.dof_map().dof_index(node, temperature, 0).unwrap()] = 1.0;
        }
    }
    system.set_time(1.0, 1.0);
    system.begin_step(true, &u);
    system.compute_residual(&u).unwrap().unwrap_accepted();

    // A secondary node projecting into the interior of a primary side
    let info = system
        .projection_locator("gap")
        .unwrap()
        .infos()
        .find(|info| info.within_side && info.side_basis.iter().all(|&n| n > 0.1))
        .cloned()
        .unwrap();
    assert_scalar_eq!(info.gap, gap, comp = abs, tol = 1e-12);
    let dof_map = system.dof_map();
    let t_dof = |node| dof_map.dof_index(node, temperature, 0).unwrap();
    let x_dof = |node| dof_map.dof_index(node, disp, 0).unwrap();
    let (t_s, x_s) = (t_dof(info.secondary_node), x_dof(info.secondary_node));
    // The primary surface normal is the x axis, so x motion leaves the closest point in place
    let mut entries = vec![(t_s, t_s), (t_s, x_s)];
    for &p in &info.side_nodes {
        entries.extend([(t_s, t_dof(p)), (t_s, x_dof(p)), (t_dof(p), t_s), (t_dof(p), x_s)]);
    }

    system.compute_jacobian(&u).unwrap().unwrap_accepted();
    let jacobian = system.global_jacobian().clone();
    // The gap opens with the secondary node, which lowers the conductance
    assert!(jacobian.get(t_s, x_s) < 0.0);

    let h = 1e-7;
    for (row, col) in entries {
        let mut residual_at = |offset: f64| {
            let mut perturbed = u.clone();
            perturbed[col] += offset;
            system.compute_residual(&perturbed).unwrap().unwrap_accepted();
            system.residual()[row]
        };
        let approx = (residual_at(h) - residual_at(-h)) / (2.0 * h);
        let exact = jacobian.get(row, col);
        assert_scalar_eq!(exact, approx, comp = abs, tol = 1e-5 * exact.abs().max(1.0));
    }
}
