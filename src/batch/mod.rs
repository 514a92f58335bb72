//! In-memory row batches
//!
//! A [`RowBatch`] is a column-named table of JSON values, the shape the
//! transform step hands to the loader. Every cell written after
//! construction keeps the value it had before the first write, so callers
//! can always ask what a key looked like when the batch arrived.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Identifier type for local and database keys
pub type Key = i64;

/// Error type for malformed batches
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    /// Row count or width differs from what the caller expected
    #[error("Unexpected batch shape: {0}")]
    UnexpectedShape(String),

    /// A column the target needs is absent
    #[error("Missing column '{0}'")]
    MissingColumn(String),

    /// A key column holds something that is not an integer
    #[error("Invalid key in column '{column}' at row {row}: {value}")]
    InvalidKey {
        column: String,
        row: usize,
        value: Value,
    },
}

/// Integer key held by a cell, if any
///
/// Integral floats are accepted since upstream frames often widen nullable
/// integer columns to floats.
pub fn key_of(value: &Value) -> Option<Key> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as Key)
        }),
        _ => None,
    }
}

/// Cell value for a key
pub fn key_value(key: Key) -> Value {
    Value::from(key)
}

/// Compare two cells, treating `1` and `1.0` as the same key
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (key_of(a), key_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered, mutable rows sharing one set of columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    /// Column index -> values before the first write to that column
    originals: HashMap<usize, Vec<Value>>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            originals: HashMap::new(),
        }
    }

    /// Build a batch from rows, checking every row's width
    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, BatchError> {
        let mut batch = Self::new(columns);
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Build a batch from JSON records
    ///
    /// Columns appear in first-seen record key order; absent fields become
    /// null.
    pub fn from_records(records: Vec<Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for name in record.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|c| record.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self {
            columns,
            rows,
            originals: HashMap::new(),
        }
    }

    /// Parse a JSON array of objects
    pub fn from_json(content: &str) -> Result<Self, BatchError> {
        let parsed: Value = serde_json::from_str(content)
            .map_err(|e| BatchError::UnexpectedShape(format!("not valid JSON: {}", e)))?;
        let Value::Array(items) = parsed else {
            return Err(BatchError::UnexpectedShape(
                "expected a JSON array of records".to_string(),
            ));
        };
        let mut records = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(record) => records.push(record),
                other => {
                    return Err(BatchError::UnexpectedShape(format!(
                        "record {} is not an object: {}",
                        i, other
                    )));
                }
            }
        }
        Ok(Self::from_records(records))
    }

    /// Current rows as JSON records
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), BatchError> {
        if row.len() != self.columns.len() {
            return Err(BatchError::UnexpectedShape(format!(
                "row {} has {} values for {} columns",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        for (col, values) in self.originals.iter_mut() {
            values.push(row[*col].clone());
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, BatchError> {
        self.column_index(name)
            .ok_or_else(|| BatchError::MissingColumn(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Current value of a cell
    pub fn get(&self, row: usize, col: usize) -> &Value {
        &self.rows[row][col]
    }

    /// Current value of a cell by column name
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.column_index(column).map(|col| self.get(row, col))
    }

    /// Value a cell had when the batch was built
    pub fn original(&self, row: usize, col: usize) -> &Value {
        match self.originals.get(&col) {
            Some(values) => &values[row],
            None => &self.rows[row][col],
        }
    }

    /// Overwrite a cell, snapshotting the column on first write
    pub fn set(&mut self, row: usize, col: usize, value: Value) {
        if !self.originals.contains_key(&col) {
            let snapshot = self.rows.iter().map(|r| r[col].clone()).collect();
            self.originals.insert(col, snapshot);
        }
        self.rows[row][col] = value;
    }

    /// Integer key held by a cell
    pub fn key_at(&self, row: usize, col: usize) -> Result<Key, BatchError> {
        let value = self.get(row, col);
        key_of(value).ok_or_else(|| BatchError::InvalidKey {
            column: self.columns[col].clone(),
            row,
            value: value.clone(),
        })
    }

    /// Check that every row holds an integer key in `column`
    pub fn check_keys(&self, column: &str) -> Result<(), BatchError> {
        let col = self.require_column(column)?;
        for row in 0..self.rows.len() {
            self.key_at(row, col)?;
        }
        Ok(())
    }

    /// Put back every written column as it was before its first write
    pub fn restore_originals(&mut self) {
        for (col, values) in self.originals.drain() {
            for (row, value) in self.rows.iter_mut().zip(values) {
                row[col] = value;
            }
        }
    }
}
