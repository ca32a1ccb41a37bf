use crate::assembly::buffers::{LocalContributionBuffer, RowSet};
use crate::dof::DofMap;
use crate::linalg::{GlobalMatrix, GlobalVector};
use crate::parallel::{Communicator, CommunicatorExt};
use crate::Real;
use log::{debug, warn};
use std::collections::BTreeMap;

/// A staged replacement of one global row.
///
/// Replacements are collected during an evaluation pass and applied in a single commit, after
/// all ordinary contributions have been closed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRowReplacement<T> {
    pub row: usize,
    pub residual: Option<T>,
    /// Sorted by column, without duplicates.
    pub jacobian: Option<Vec<(usize, T)>>,
    /// Name of the contribution that staged the replacement.
    pub source: String,
}

/// Which row sets of a local buffer replace their global rows instead of adding to them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RowOwnership {
    pub secondary: bool,
    pub lower: bool,
}

impl RowOwnership {
    pub fn additive() -> Self {
        Self::default()
    }

    pub fn overwrites(&self, rows: RowSet) -> bool {
        match rows {
            RowSet::Secondary => self.secondary,
            RowSet::Primary => false,
            RowSet::Lower => self.lower,
        }
    }
}

/// Folds local contributions into the global residual and Jacobian.
///
/// Additive contributions are scaled by the scaling factor of the row's variable. Overwritten rows
/// are not scaled.
#[derive(Debug, Clone)]
pub struct AssemblyAccumulator<T: Real> {
    residual_additions: Vec<(usize, T)>,
    jacobian_additions: Vec<(usize, usize, T)>,
    pending: BTreeMap<usize, PendingRowReplacement<T>>,
}

impl<T: Real> Default for AssemblyAccumulator<T> {
    fn default() -> Self {
        Self {
            residual_additions: Vec::new(),
            jacobian_additions: Vec::new(),
            pending: BTreeMap::new(),
        }
    }
}

impl<T: Real> AssemblyAccumulator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.residual_additions.clear();
        self.jacobian_additions.clear();
        self.pending.clear();
    }

    pub fn add_residual(&mut self, dof_map: &DofMap<T>, row: usize, value: T) {
        self.residual_additions
            .push((row, value * dof_map.scaling(row)));
    }

    pub fn add_jacobian(&mut self, dof_map: &DofMap<T>, row: usize, col: usize, value: T) {
        self.jacobian_additions
            .push((row, col, value * dof_map.scaling(row)));
    }

    /// Whether the row is staged for replacement in the current pass.
    pub fn is_staged(&self, row: usize) -> bool {
        self.pending.contains_key(&row)
    }

    pub fn pending_replacements(&self) -> impl Iterator<Item = &PendingRowReplacement<T>> {
        self.pending.values()
    }

    fn pending_entry(&mut self, source: &str, row: usize) -> &mut PendingRowReplacement<T> {
        self.pending
            .entry(row)
            .or_insert_with(|| PendingRowReplacement {
                row,
                residual: None,
                jacobian: None,
                source: source.to_string(),
            })
    }

    /// Stages the residual value of a replaced row. If the row was already staged, the later
    /// value wins.
    pub fn stage_residual_replacement(&mut self, source: &str, row: usize, value: T) {
        let entry = self.pending_entry(source, row);
        if entry.residual.is_some() || entry.source != source {
            warn!(
                "Residual row {row} is replaced by '{source}' after '{}' already staged it",
                entry.source
            );
            entry.source = source.to_string();
        }
        entry.residual = Some(value);
    }

    /// Stages Jacobian entries of a replaced row.
    ///
    /// Entries staged by the same source in the same pass are summed, so that a constraint may
    /// contribute the columns of several coupled variables to one row. A different source
    /// replaces the row entirely.
    pub fn stage_jacobian_replacement(&mut self, source: &str, row: usize, entries: impl IntoIterator<Item = (usize, T)>) {
        let entry = self.pending_entry(source, row);
        if entry.source != source {
            warn!(
                "Jacobian row {row} is replaced by '{source}' after '{}' already staged it",
                entry.source
            );
            entry.source = source.to_string();
            entry.jacobian = None;
        }
        let mut merged: BTreeMap<usize, T> = entry.jacobian.take().unwrap_or_default().into_iter().collect();
        for (col, value) in entries {
            let v = merged.entry(col).or_insert_with(T::zero);
            *v += value;
        }
        entry.jacobian = Some(merged.into_iter().collect());
    }

    /// Folds the residual blocks of a local buffer.
    pub fn fold_residual(
        &mut self,
        source: &str,
        buffer: &LocalContributionBuffer<T>,
        ownership: RowOwnership,
        dof_map: &DofMap<T>,
    ) {
        for rows in RowSet::ALL {
            let residual = buffer.residual(rows);
            for (&dof, &value) in buffer.row_dofs(rows).iter().zip(residual.iter()) {
                if ownership.overwrites(rows) {
                    self.stage_residual_replacement(source, dof, value);
                } else {
                    self.add_residual(dof_map, dof, value);
                }
            }
        }
    }

    /// Folds the Jacobian blocks of a local buffer.
    pub fn fold_jacobian(
        &mut self,
        source: &str,
        buffer: &LocalContributionBuffer<T>,
        ownership: RowOwnership,
        dof_map: &DofMap<T>,
    ) {
        for rows in RowSet::ALL {
            for (local_row, &dof) in buffer.row_dofs(rows).iter().enumerate() {
                if ownership.overwrites(rows) {
                    self.stage_jacobian_replacement(source, dof, buffer.row_entries(rows, local_row));
                } else {
                    for (col, value) in buffer.row_entries(rows, local_row) {
                        if value != T::zero() {
                            self.add_jacobian(dof_map, dof, col, value);
                        }
                    }
                }
            }
        }
    }

    /// Applies all additive and staged residual contributions. Collective.
    pub fn commit_residual<C: Communicator + ?Sized>(&mut self, residual: &mut GlobalVector<T>, comm: &C) {
        for (row, value) in self.residual_additions.drain(..) {
            residual.add(row, value);
        }
        let mut staged = 0;
        for replacement in self.pending.values() {
            if let Some(value) = replacement.residual {
                residual.set(replacement.row, value);
                staged += 1;
            }
        }
        // Additions are applied before insertions, so staged values replace the row entirely
        residual.close(comm);
        debug!("Committed residual: {staged} replaced rows on processor {}", comm.rank());
    }

    /// Applies all additive contributions, then replaces the staged rows. Collective.
    ///
    /// The replaced rows are zeroed after the additive contributions of all processors have been
    /// closed and before the staged entries are inserted.
    pub fn commit_jacobian<C: Communicator + ?Sized>(&mut self, jacobian: &mut GlobalMatrix<T>, comm: &C) {
        for (row, col, value) in self.jacobian_additions.drain(..) {
            jacobian.add(row, col, value);
        }
        jacobian.close(comm);

        let rows: Vec<usize> = self
            .pending
            .values()
            .filter(|r| r.jacobian.is_some())
            .map(|r| r.row)
            .collect();
        // Every processor has to take part in zeroing, even if it staged nothing itself
        let any_staged = comm.all_reduce_or(!rows.is_empty());
        if !any_staged {
            return;
        }
        jacobian.zero_rows(&rows, None, comm);
        for replacement in self.pending.values() {
            if let Some(entries) = &replacement.jacobian {
                for &(col, value) in entries {
                    jacobian.add(replacement.row, col, value);
                }
            }
        }
        jacobian.close(comm);
        debug!("Committed Jacobian: {} replaced rows on processor {}", rows.len(), comm.rank());
    }
}
