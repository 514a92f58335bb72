//! Hierarchical views over a row batch
//!
//! A [`RowSetHandler`] is a set of row indices into one canonical
//! [`RowBatch`]. Sub-handlers narrow the index set; they never copy rows.
//! Key rewrites go straight to the canonical batch, so a rewrite made while
//! working on one observation's rows is seen by every other view of the
//! same batch.

use serde_json::Value;
use std::collections::HashSet;

use crate::batch::{BatchError, Key, RowBatch, key_of, key_value, same_value};

/// A filtered view over one batch
#[derive(Debug)]
pub struct RowSetHandler<'b> {
    batch: &'b mut RowBatch,
    rows: Vec<usize>,
    depth: usize,
}

impl<'b> RowSetHandler<'b> {
    /// Root handler over every row of a batch
    pub fn new(batch: &'b mut RowBatch) -> Self {
        let rows = (0..batch.len()).collect();
        Self {
            batch,
            rows,
            depth: 0,
        }
    }

    /// Child view over the rows whose original `column` value is one of `values`
    ///
    /// Matching uses the values the batch arrived with, so a view can be
    /// taken before or after keys have been rewritten.
    pub fn sub_handler(
        &mut self,
        column: &str,
        values: &[Value],
    ) -> Result<RowSetHandler<'_>, BatchError> {
        let col = self.batch.require_column(column)?;
        let rows = self
            .rows
            .iter()
            .copied()
            .filter(|&row| {
                let original = self.batch.original(row, col);
                values.iter().any(|v| same_value(original, v))
            })
            .collect();
        Ok(RowSetHandler {
            batch: &mut *self.batch,
            rows,
            depth: self.depth + 1,
        })
    }

    pub fn batch(&self) -> &RowBatch {
        &*self.batch
    }

    /// Indices of the rows in this view
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Nesting level, 0 for a root handler
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// First row for each distinct current key in this view
    pub fn unique_rows(&self, key_column: &str) -> Result<Vec<usize>, BatchError> {
        let col = self.batch.require_column(key_column)?;
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for &row in &self.rows {
            if seen.insert(self.batch.key_at(row, col)?) {
                unique.push(row);
            }
        }
        Ok(unique)
    }

    /// Distinct current keys in this view, in row order
    pub fn keys(&self, key_column: &str) -> Result<Vec<Key>, BatchError> {
        let col = self.batch.require_column(key_column)?;
        self.unique_rows(key_column)?
            .into_iter()
            .map(|row| self.batch.key_at(row, col))
            .collect()
    }

    /// Distinct original values of a column in this view, nulls skipped
    pub fn original_values(&self, column: &str) -> Result<Vec<Value>, BatchError> {
        let col = self.batch.require_column(column)?;
        let mut values: Vec<Value> = Vec::new();
        for &row in &self.rows {
            let value = self.batch.original(row, col);
            if !value.is_null() && !values.iter().any(|v| same_value(v, value)) {
                values.push(value.clone());
            }
        }
        Ok(values)
    }

    /// Current keys held anywhere in the canonical batch
    pub fn parent_keys(&self, key_column: &str) -> Result<HashSet<Key>, BatchError> {
        let col = self.batch.require_column(key_column)?;
        Ok((0..self.batch.len())
            .filter_map(|row| key_of(self.batch.get(row, col)))
            .collect())
    }

    /// Largest current key anywhere in the canonical batch
    pub fn max_parent_key(&self, key_column: &str) -> Result<Option<Key>, BatchError> {
        Ok(self.parent_keys(key_column)?.into_iter().max())
    }

    /// Rewrite every `from` key in the canonical batch to `to`
    ///
    /// Returns the number of cells changed.
    pub fn update_value(&mut self, column: &str, from: Key, to: Key) -> Result<usize, BatchError> {
        let col = self.batch.require_column(column)?;
        let mut changed = 0;
        for row in 0..self.batch.len() {
            if key_of(self.batch.get(row, col)) == Some(from) {
                self.batch.set(row, col, key_value(to));
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Rewrite this view's `column` from its original values
    ///
    /// `lookup` maps an original key to its replacement; unmapped keys keep
    /// their current value. Running it twice gives the same result.
    pub fn remap_from_originals<F>(&mut self, column: &str, lookup: F) -> Result<usize, BatchError>
    where
        F: Fn(Key) -> Option<Key>,
    {
        let Some(col) = self.batch.column_index(column) else {
            return Ok(0);
        };
        let mut changed = 0;
        for &row in &self.rows {
            let Some(original) = key_of(self.batch.original(row, col)) else {
                continue;
            };
            if let Some(mapped) = lookup(original)
                && key_of(self.batch.get(row, col)) != Some(mapped)
            {
                self.batch.set(row, col, key_value(mapped));
                changed += 1;
            }
        }
        Ok(changed)
    }
}
