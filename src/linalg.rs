//! Replicated global vectors and matrices with deferred, collective finalization.
//!
//! Both [`GlobalVector`] and [`GlobalMatrix`] follow the same discipline: `add` and `set` only
//! record *pending* operations, which become visible after the collective `close`. Reading
//! always observes the state as of the last `close`. Every processor holds a full copy of the
//! closed object, so after `close` all processors agree bit for bit.
use crate::parallel::{Communicator, CommunicatorExt};
use crate::Real;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVector<T: Real> {
    values: DVector<T>,
    pending_add: Vec<(usize, T)>,
    pending_set: Vec<(usize, T)>,
}

impl<T: Real> GlobalVector<T> {
    pub fn zeros(len: usize) -> Self {
        Self::from_vector(DVector::zeros(len))
    }

    pub fn from_vector(values: DVector<T>) -> Self {
        Self {
            values,
            pending_add: Vec::new(),
            pending_set: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn add(&mut self, index: usize, value: T) {
        assert!(index < self.len(), "index out of bounds");
        self.pending_add.push((index, value));
    }

    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len(), "index out of bounds");
        self.pending_set.push((index, value));
    }

    /// Whether this processor has pending operations.
    pub fn has_pending(&self) -> bool {
        !self.pending_add.is_empty() || !self.pending_set.is_empty()
    }

    /// Value as of the last `close`.
    pub fn get(&self, index: usize) -> T {
        self.values[index]
    }

    /// The closed values.
    pub fn values(&self) -> &DVector<T> {
        &self.values
    }

    /// Discards all values and pending operations on this processor.
    pub fn zero(&mut self) {
        self.values.fill(T::zero());
        self.pending_add.clear();
        self.pending_set.clear();
    }

    /// Applies the pending operations of all processors.
    ///
    /// Additions are applied first, in rank order, followed by insertions, in rank order. Mixing
    /// additions and insertions to the same entry within one phase is therefore well defined:
    /// the insertion wins.
    pub fn close<C: Communicator + ?Sized>(&mut self, comm: &C) {
        let adds = comm.all_gather(std::mem::take(&mut self.pending_add));
        let sets = comm.all_gather(std::mem::take(&mut self.pending_set));
        for (i, v) in adds.into_iter().flatten() {
            self.values[i] += v;
        }
        for (i, v) in sets.into_iter().flatten() {
            self.values[i] = v;
        }
    }
}

/// A square sparse matrix with a CSR representation of the closed state.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMatrix<T: Real> {
    csr: CsrMatrix<T>,
    pending: Vec<(usize, usize, T)>,
}

impl<T: Real> GlobalMatrix<T> {
    pub fn zeros(n: usize) -> Self {
        Self {
            csr: CsrMatrix::zeros(n, n),
            pending: Vec::new(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.csr.nrows()
    }

    pub fn add(&mut self, row: usize, col: usize, value: T) {
        assert!(row < self.nrows() && col < self.nrows(), "index out of bounds");
        self.pending.push((row, col, value));
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The closed matrix.
    pub fn csr(&self) -> &CsrMatrix<T> {
        &self.csr
    }

    /// Entry as of the last `close`. Entries outside the sparsity pattern are zero.
    pub fn get(&self, row: usize, col: usize) -> T {
        let row = self.csr.row(row);
        match row.col_indices().binary_search(&col) {
            Ok(local) => row.values()[local],
            Err(_) => T::zero(),
        }
    }

    /// Explicitly stored entries of a closed row.
    pub fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let offsets = self.csr.row_offsets();
        let range = offsets[row]..offsets[row + 1];
        self.csr.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.csr.values()[range].iter().copied())
    }

    /// Sets all values to zero while retaining the sparsity pattern. Pending additions are dropped.
    pub fn zero(&mut self) {
        self.csr.values_mut().fill(T::zero());
        self.pending.clear();
    }

    /// Applies the pending additions of all processors.
    ///
    /// Additions that fall inside the current sparsity pattern are applied in place. Otherwise the
    /// matrix is rebuilt with the enlarged pattern.
    pub fn close<C: Communicator + ?Sized>(&mut self, comm: &C) {
        let gathered = comm.all_gather(std::mem::take(&mut self.pending));
        let triplets: Vec<_> = gathered.into_iter().flatten().collect();
        if triplets.is_empty() {
            return;
        }

        let fits_pattern = triplets.iter().all(|&(i, j, _)| {
            self.csr
                .row(i)
                .col_indices()
                .binary_search(&j)
                .is_ok()
        });

        if fits_pattern {
            for (i, j, v) in triplets {
                let mut row = self.csr.row_mut(i);
                let (cols, values) = row.cols_and_values_mut();
                if let Ok(local) = cols.binary_search(&j) {
                    values[local] += v;
                }
            }
        } else {
            self.rebuild_with(triplets);
        }
    }

    /// Zeros the given rows of the closed matrix, optionally placing `diagonal` on the diagonal.
    ///
    /// Collective: the rows requested by all processors are zeroed on every processor.
    ///
    /// # Panics
    ///
    /// Panics if there are pending additions on this processor: rows must be zeroed after all
    /// ordinary contributions have been closed, never before.
    pub fn zero_rows<C: Communicator + ?Sized>(&mut self, rows: &[usize], diagonal: Option<T>, comm: &C) {
        assert!(self.pending.is_empty(), "zero_rows requires a closed matrix");
        let all_rows: BTreeSet<usize> = comm.all_gather(rows.to_vec()).into_iter().flatten().collect();
        for &i in &all_rows {
            let mut row = self.csr.row_mut(i);
            let (cols, values) = row.cols_and_values_mut();
            for (&j, v) in cols.iter().zip(values.iter_mut()) {
                *v = match diagonal {
                    Some(d) if i == j => d,
                    _ => T::zero(),
                };
            }
        }
        if let Some(diagonal) = diagonal {
            for &i in &all_rows {
                if self.csr.row(i).col_indices().binary_search(&i).is_err() {
                    self.pending.push((i, i, diagonal));
                }
            }
            // Every processor computed the same missing entries from the same closed matrix,
            // so they are applied locally without another exchange
            let missing = std::mem::take(&mut self.pending);
            if !missing.is_empty() {
                self.rebuild_with(missing);
            }
        }
    }

    fn rebuild_with(&mut self, triplets: Vec<(usize, usize, T)>) {
        let n = self.nrows();
        let mut coo = CooMatrix::new(n, n);
        for (i, j, v) in self.csr.triplet_iter() {
            coo.push(i, j, *v);
        }
        for (i, j, v) in triplets {
            coo.push(i, j, v);
        }
        self.csr = CsrMatrix::from(&coo);
    }

    pub fn to_dense(&self) -> DMatrix<T> {
        DMatrix::from(&self.csr)
    }
}
