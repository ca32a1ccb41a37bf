use mortise::assembly::{AssemblyAccumulator, LocalContributionBuffer, RowOwnership, RowSet};
use mortise::dof::{DofMap, DofMapBuilder, VariableSupport};
use mortise::linalg::{GlobalMatrix, GlobalVector};
use mortise::mesh::procedural::{create_rectangular_quad_mesh, RectangleTags};
use mortise::mesh::SubdomainTag;
use mortise::parallel::SerialCommunicator;
use nalgebra::{point, vector};

/// One cell, so four nodes: a scalar `u` scaled by 2 and a scalar `w`.
fn single_cell_dofs() -> DofMap<f64> {
    let mesh = create_rectangular_quad_mesh(
        &point![0.0, 0.0],
        &vector![1.0, 1.0],
        [1, 1],
        SubdomainTag(0),
        RectangleTags::consecutive(0),
    );
    let mut builder = DofMapBuilder::new();
    builder.add_scaled_variable("u", 1, 2.0, VariableSupport::AllNodes);
    builder.add_variable("w", 1, VariableSupport::AllNodes);
    builder.build(&mesh)
}

#[test]
fn additive_contributions_are_scaled_by_variable() {
    let dof_map = single_cell_dofs();
    let mut accumulator = AssemblyAccumulator::new();
    let mut residual = GlobalVector::zeros(dof_map.num_dofs());
    accumulator.add_residual(&dof_map, 0, 1.5);
    accumulator.add_residual(&dof_map, 0, 0.5);
    accumulator.add_residual(&dof_map, 4, 1.0);
    accumulator.commit_residual(&mut residual, &SerialCommunicator);
    assert_eq!(residual.get(0), 4.0);
    assert_eq!(residual.get(4), 1.0);
}

#[test]
fn staged_residual_replaces_additions() {
    let dof_map = single_cell_dofs();
    let mut accumulator = AssemblyAccumulator::new();
    let mut residual = GlobalVector::zeros(dof_map.num_dofs());
    accumulator.add_residual(&dof_map, 1, 10.0);
    accumulator.stage_residual_replacement("tie", 1, 3.0);
    // Additions staged after the replacement are also discarded
    accumulator.add_residual(&dof_map, 1, 10.0);
    accumulator.add_residual(&dof_map, 2, 1.0);
    accumulator.commit_residual(&mut residual, &SerialCommunicator);

    // Replacements are not scaled
    assert_eq!(residual.get(1), 3.0);
    assert_eq!(residual.get(2), 2.0);
}

#[test]
fn staged_jacobian_row_contains_exactly_the_inserted_entries() {
    let dof_map = single_cell_dofs();
    let n = dof_map.num_dofs();
    let mut jacobian = GlobalMatrix::zeros(n);
    let mut accumulator = AssemblyAccumulator::new();
    for row in 0..n {
        for col in 0..n {
            accumulator.add_jacobian(&dof_map, row, col, 1.0);
        }
    }
    accumulator.commit_jacobian(&mut jacobian, &SerialCommunicator);
    accumulator.clear();

    accumulator.add_jacobian(&dof_map, 3, 0, 5.0);
    accumulator.add_jacobian(&dof_map, 5, 5, 1.0);
    accumulator.stage_jacobian_replacement("tie", 3, [(3, 1.0), (6, -0.5)]);
    accumulator.stage_jacobian_replacement("tie", 3, [(6, -0.5)]);
    accumulator.commit_jacobian(&mut jacobian, &SerialCommunicator);

    let row: Vec<_> = jacobian
        .row_entries(3)
        .filter(|&(_, v)| v != 0.0)
        .collect();
    assert_eq!(row, vec![(3, 1.0), (6, -1.0)]);
    // Untouched rows keep their additive values
    assert_eq!(jacobian.get(2, 2), 2.0);
    assert_eq!(jacobian.get(5, 5), 2.0);
}

#[test]
fn different_source_replaces_staged_jacobian_row() {
    let dof_map = single_cell_dofs();
    let mut jacobian = GlobalMatrix::zeros(dof_map.num_dofs());
    let mut accumulator = AssemblyAccumulator::new();
    accumulator.stage_jacobian_replacement("first", 0, [(0, 1.0), (1, 1.0)]);
    accumulator.stage_jacobian_replacement("second", 0, [(2, 4.0)]);
    let staged: Vec<_> = accumulator.pending_replacements().collect();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].source, "second");
    accumulator.commit_jacobian(&mut jacobian, &SerialCommunicator);

    assert_eq!(jacobian.get(0, 0), 0.0);
    assert_eq!(jacobian.get(0, 2), 4.0);
}

#[test]
fn fold_overwrites_only_owned_row_sets() {
    let dof_map = single_cell_dofs();
    let n = dof_map.num_dofs();
    let mut buffer = LocalContributionBuffer::default();
    buffer.prepare(&[0], &[1, 2], &[]);
    buffer.residual_mut(RowSet::Secondary)[0] = 7.0;
    buffer.residual_mut(RowSet::Primary)[0] = 1.0;
    buffer.residual_mut(RowSet::Primary)[1] = -1.0;

    let mut accumulator = AssemblyAccumulator::new();
    accumulator.add_residual(&dof_map, 0, 100.0);
    let ownership = RowOwnership {
        secondary: true,
        lower: false,
    };
    accumulator.fold_residual("tie", &buffer, ownership, &dof_map);
    assert!(accumulator.is_staged(0));
    assert!(!accumulator.is_staged(1));

    let mut residual = GlobalVector::zeros(n);
    accumulator.commit_residual(&mut residual, &SerialCommunicator);
    assert_eq!(residual.get(0), 7.0);
    assert_eq!(residual.get(1), 2.0);
    assert_eq!(residual.get(2), -2.0);
}
