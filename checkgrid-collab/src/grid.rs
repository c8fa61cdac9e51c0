//! Fixed-size boolean cell store.
//!
//! The grid is the local mirror (client side) or the authoritative copy
//! (server side) of the shared checkbox matrix. It never grows or shrinks:
//! exactly `size()` cells exist for the lifetime of the value, and only
//! their contents change.
//!
//! `set` reports whether the call changed anything. Callers rely on that
//! to suppress redundant renders, which is what keeps remote updates from
//! bouncing back out as fresh edits.

use thiserror::Error;

/// Cell store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("Index {index} out of range for grid of {size} cells")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("Snapshot has {actual} cells, expected {expected}")]
    SnapshotSizeMismatch { expected: usize, actual: usize },
}

/// Ordered collection of N independent toggle cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    cells: Vec<bool>,
}

impl Grid {
    /// Create a grid of `size` cells, all unchecked.
    pub fn new(size: usize) -> Self {
        Self {
            cells: vec![false; size],
        }
    }

    /// Number of cells.
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Read one cell.
    pub fn get(&self, index: usize) -> Result<bool, GridError> {
        self.cells
            .get(index)
            .copied()
            .ok_or(GridError::IndexOutOfRange {
                index,
                size: self.cells.len(),
            })
    }

    /// Set one cell. Returns `true` only if the stored value changed.
    pub fn set(&mut self, index: usize, value: bool) -> Result<bool, GridError> {
        let size = self.cells.len();
        let cell = self
            .cells
            .get_mut(index)
            .ok_or(GridError::IndexOutOfRange { index, size })?;
        if *cell == value {
            return Ok(false);
        }
        *cell = value;
        Ok(true)
    }

    /// Copy of every cell in index order.
    pub fn snapshot(&self) -> Vec<bool> {
        self.cells.clone()
    }

    /// Overwrite the whole grid.
    ///
    /// Returns the indices whose value changed, in ascending order. On a
    /// size mismatch the grid is left untouched.
    pub fn apply_snapshot(&mut self, cells: &[bool]) -> Result<Vec<usize>, GridError> {
        if cells.len() != self.cells.len() {
            return Err(GridError::SnapshotSizeMismatch {
                expected: self.cells.len(),
                actual: cells.len(),
            });
        }

        let mut changed = Vec::new();
        for (index, (current, incoming)) in self.cells.iter_mut().zip(cells).enumerate() {
            if *current != *incoming {
                *current = *incoming;
                changed.push(index);
            }
        }
        Ok(changed)
    }

    /// Number of checked cells.
    pub fn count_set(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    /// Indices of checked cells, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.then_some(i))
    }
}
