use crate::Real;
use nalgebra::{DMatrix, DVector, Vector2};

/// The row sets of a local contribution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowSet {
    Secondary,
    Primary,
    /// Rows of an auxiliary variable, e.g. a Lagrange multiplier.
    Lower,
}

impl RowSet {
    pub const ALL: [RowSet; 3] = [RowSet::Secondary, RowSet::Primary, RowSet::Lower];

    fn index(self) -> usize {
        match self {
            Self::Secondary => 0,
            Self::Primary => 1,
            Self::Lower => 2,
        }
    }
}

/// The column sets of a local contribution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnSet {
    Secondary,
    Primary,
    Lower,
    /// All DOFs coupled to a secondary node through the elements sharing it.
    Connected,
}

impl ColumnSet {
    pub const ALL: [ColumnSet; 4] = [
        ColumnSet::Secondary,
        ColumnSet::Primary,
        ColumnSet::Lower,
        ColumnSet::Connected,
    ];

    fn index(self) -> usize {
        match self {
            Self::Secondary => 0,
            Self::Primary => 1,
            Self::Lower => 2,
            Self::Connected => 3,
        }
    }
}

/// Dense residual and Jacobian blocks for a single constraint evaluation.
///
/// Rows and columns carry global DOF indices. By default the secondary, primary and lower
/// column sets mirror the corresponding row sets, so that a constraint on a single variable can
/// fill its four classic blocks (secondary-secondary, secondary-primary, primary-secondary and
/// primary-primary) without further setup. For off-diagonal Jacobians the column sets are
/// replaced by the DOFs of the coupled variable.
#[derive(Debug, Clone)]
pub struct LocalContributionBuffer<T: Real> {
    row_dofs: [Vec<usize>; 3],
    column_dofs: [Vec<usize>; 4],
    residuals: [DVector<T>; 3],
    /// Indexed by `4 * row set + column set`.
    blocks: Vec<DMatrix<T>>,
}

impl<T: Real> Default for LocalContributionBuffer<T> {
    fn default() -> Self {
        Self {
            row_dofs: Default::default(),
            column_dofs: Default::default(),
            residuals: [DVector::zeros(0), DVector::zeros(0), DVector::zeros(0)],
            blocks: vec![DMatrix::zeros(0, 0); 12],
        }
    }
}

impl<T: Real> LocalContributionBuffer<T> {
    fn block_index(rows: RowSet, columns: ColumnSet) -> usize {
        4 * rows.index() + columns.index()
    }

    /// Resets the buffer for a new evaluation with the given row DOFs.
    ///
    /// The connected column set is emptied.
    pub fn prepare(&mut self, secondary: &[usize], primary: &[usize], lower: &[usize]) {
        for (set, dofs) in RowSet::ALL.into_iter().zip([secondary, primary, lower]) {
            self.row_dofs[set.index()].clear();
            self.row_dofs[set.index()].extend_from_slice(dofs);
        }
        self.column_dofs[0].clone_from(&self.row_dofs[0]);
        self.column_dofs[1].clone_from(&self.row_dofs[1]);
        self.column_dofs[2].clone_from(&self.row_dofs[2]);
        self.column_dofs[3].clear();
        self.reset_values();
    }

    /// Replaces the DOFs of a column set and zeros all values.
    pub fn set_column_dofs(&mut self, columns: ColumnSet, dofs: &[usize]) {
        self.column_dofs[columns.index()].clear();
        self.column_dofs[columns.index()].extend_from_slice(dofs);
        self.reset_values();
    }

    /// Zeros all blocks, resizing them to the current row and column sets.
    pub fn reset_values(&mut self) {
        for rows in RowSet::ALL {
            let nrows = self.row_dofs[rows.index()].len();
            self.residuals[rows.index()] = DVector::zeros(nrows);
            for columns in ColumnSet::ALL {
                let ncols = self.column_dofs[columns.index()].len();
                let block = &mut self.blocks[Self::block_index(rows, columns)];
                block.resize_mut(nrows, ncols, T::zero());
                block.fill(T::zero());
            }
        }
    }

    pub fn row_dofs(&self, rows: RowSet) -> &[usize] {
        &self.row_dofs[rows.index()]
    }

    pub fn column_dofs(&self, columns: ColumnSet) -> &[usize] {
        &self.column_dofs[columns.index()]
    }

    pub fn residual(&self, rows: RowSet) -> &DVector<T> {
        &self.residuals[rows.index()]
    }

    pub fn residual_mut(&mut self, rows: RowSet) -> &mut DVector<T> {
        &mut self.residuals[rows.index()]
    }

    pub fn jacobian(&self, rows: RowSet, columns: ColumnSet) -> &DMatrix<T> {
        &self.blocks[Self::block_index(rows, columns)]
    }

    pub fn jacobian_mut(&mut self, rows: RowSet, columns: ColumnSet) -> &mut DMatrix<T> {
        &mut self.blocks[Self::block_index(rows, columns)]
    }

    /// The entries of one local row across all column sets, as (global column, value) pairs.
    ///
    /// Columns appearing in several column sets are listed once per set.
    pub fn row_entries(&self, rows: RowSet, local_row: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        ColumnSet::ALL.into_iter().flat_map(move |columns| {
            let block = self.jacobian(rows, columns);
            self.column_dofs(columns)
                .iter()
                .enumerate()
                .map(move |(j, &dof)| (dof, block[(local_row, j)]))
        })
    }

    /// Adds the linearization of a point coupling between a secondary node and a point on the
    /// primary side.
    ///
    /// The coupling has residual `-f a` on the secondary node and `N_i f a` on primary node `i`,
    /// where the scalar `f` varies as `df = -kappa * b . (du_s - sum_j N_j du_j)`. Secondary and primary
    /// column sets must hold the two components of a vector variable, in node-major order.
    pub fn add_coupled_pair_jacobian(&mut self, kappa: T, a: &Vector2<T>, b: &Vector2<T>, basis: &[T]) {
        let outer = a * b.transpose() * kappa;
        {
            let j_ss = self.jacobian_mut(RowSet::Secondary, ColumnSet::Secondary);
            for r in 0..2 {
                for c in 0..2 {
                    j_ss[(r, c)] += outer[(r, c)];
                }
            }
        }
        for (i, &n_i) in basis.iter().enumerate() {
            {
                let j_sp = self.jacobian_mut(RowSet::Secondary, ColumnSet::Primary);
                for r in 0..2 {
                    for c in 0..2 {
                        j_sp[(r, 2 * i + c)] -= outer[(r, c)] * n_i;
                    }
                }
            }
            {
                let j_ps = self.jacobian_mut(RowSet::Primary, ColumnSet::Secondary);
                for r in 0..2 {
                    for c in 0..2 {
                        j_ps[(2 * i + r, c)] -= outer[(r, c)] * n_i;
                    }
                }
            }
            let j_pp = self.jacobian_mut(RowSet::Primary, ColumnSet::Primary);
            for (j, &n_j) in basis.iter().enumerate() {
                for r in 0..2 {
                    for c in 0..2 {
                        j_pp[(2 * i + r, 2 * j + c)] += outer[(r, c)] * n_i * n_j;
                    }
                }
            }
        }
    }
}
