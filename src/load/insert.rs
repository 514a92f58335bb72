//! Insert primitive
//!
//! Staging turns a handler's rows into the attribute rows one table
//! accepts. [`insert_rows`] sends them in one statement and classifies
//! failures; [`insert_row_or_fetch`] handles a single row under its own
//! savepoint and falls back to looking up the existing duplicate.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{IdentifierMap, LoadError, LoadResult};
use crate::batch::{Key, key_of};
use crate::database::{ConstraintKind, DatabaseError, LoadConnection};
use crate::handler::RowSetHandler;
use crate::target::TargetDescriptor;

/// Rows of one target ready for insertion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedRows {
    /// Table columns, in insert order
    pub columns: Vec<String>,
    /// Current local key of each row
    pub local_keys: Vec<Key>,
    /// Local key each row had when the batch arrived
    pub original_keys: Vec<Key>,
    /// One value per column for each row
    pub rows: Vec<Vec<Value>>,
}

impl StagedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column/value pairs of one row
    pub fn attributes(&self, index: usize) -> Map<String, Value> {
        self.columns
            .iter()
            .cloned()
            .zip(self.rows[index].iter().cloned())
            .collect()
    }

    /// All rows as a JSON array, for error reports
    pub fn to_json(&self) -> String {
        let records: Vec<Value> = (0..self.len())
            .map(|i| Value::Object(self.attributes(i)))
            .collect();
        Value::Array(records).to_string()
    }
}

/// Outcome of a single-row insert-or-fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// The row was new
    Inserted(Key),
    /// An identical row already existed
    Fetched(Key),
}

impl RowOutcome {
    pub fn id(&self) -> Key {
        match self {
            RowOutcome::Inserted(id) | RowOutcome::Fetched(id) => *id,
        }
    }
}

/// Select the rows and columns of one target from a handler
///
/// Columns are those the target owns that exist in the physical table.
/// Rows are deduplicated on the local key (first occurrence wins); rows
/// already resolved in `resolved` are left out.
pub fn stage_rows(
    handler: &RowSetHandler<'_>,
    target: &TargetDescriptor,
    table_columns: &[String],
    resolved: &IdentifierMap,
) -> LoadResult<StagedRows> {
    let batch = handler.batch();
    let key_col = batch.require_column(&target.local_key)?;

    let mut sources: Vec<usize> = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    for (i, name) in batch.columns().iter().enumerate() {
        if let Some(column) = target.table_column_for(name)
            && column != target.id_column
            && table_columns.contains(&column)
            && !columns.contains(&column)
        {
            sources.push(i);
            columns.push(column);
        }
    }

    let mut staged = StagedRows {
        columns,
        ..StagedRows::default()
    };
    for row in handler.unique_rows(&target.local_key)? {
        let current = batch.key_at(row, key_col)?;
        let original = key_of(batch.original(row, key_col)).unwrap_or(current);
        if resolved.get(original).is_some() || resolved.contains_db_id(current) {
            continue;
        }
        staged.local_keys.push(current);
        staged.original_keys.push(original);
        staged
            .rows
            .push(sources.iter().map(|&c| batch.get(row, c).clone()).collect());
    }
    Ok(staged)
}

/// Map a database error to the load taxonomy
fn classify(
    target: &TargetDescriptor,
    error: DatabaseError,
    attributes: impl FnOnce() -> String,
) -> LoadError {
    let table = target.table_name.clone();
    match error.constraint_violation() {
        Some(violation) if target.is_duplicate_violation(violation) => LoadError::DuplicateInsert {
            table,
            message: violation.to_string(),
        },
        Some(violation) if violation.kind == ConstraintKind::ForeignKey => LoadError::ForeignKey {
            table,
            message: violation.to_string(),
        },
        _ => LoadError::LoadFailure {
            table,
            message: error.to_string(),
            attributes: attributes(),
        },
    }
}

/// Insert every staged row in one statement
///
/// Returns one database key per staged row, in staging order. Does not
/// open or close any transaction.
pub async fn insert_rows<C: LoadConnection + ?Sized>(
    conn: &mut C,
    target: &TargetDescriptor,
    staged: &StagedRows,
) -> LoadResult<Vec<Key>> {
    if staged.is_empty() {
        return Ok(Vec::new());
    }
    let ids = conn
        .insert_returning_ids(&target.table_name, &target.id_column, &staged.columns, &staged.rows)
        .await
        .map_err(|e| classify(target, e, || staged.to_json()))?;

    if ids.len() != staged.len() {
        return Err(LoadError::LoadFailure {
            table: target.table_name.clone(),
            message: format!(
                "insert returned {} identifiers for {} rows",
                ids.len(),
                staged.len()
            ),
            attributes: staged.to_json(),
        });
    }
    Ok(ids)
}

/// Insert one row, or find the row it duplicates
///
/// The insert runs under `savepoint`, which is released on success and
/// rolled back on failure. Duplicate and foreign key conflicts are answered
/// by looking up a row with the same attributes, ignoring the target's
/// match exclusions; finding none is fatal.
pub async fn insert_row_or_fetch<C: LoadConnection + ?Sized>(
    conn: &mut C,
    target: &TargetDescriptor,
    columns: &[String],
    row: &[Value],
    savepoint: &str,
) -> LoadResult<RowOutcome> {
    let attributes = || -> String {
        let record: Map<String, Value> = columns.iter().cloned().zip(row.iter().cloned()).collect();
        Value::Object(record).to_string()
    };

    let rows = vec![row.to_vec()];
    conn.savepoint(savepoint).await?;
    let result = conn
        .insert_returning_ids(&target.table_name, &target.id_column, columns, &rows)
        .await;

    let error = match result {
        Ok(ids) => {
            conn.release_savepoint(savepoint).await?;
            return match ids.as_slice() {
                [id] => Ok(RowOutcome::Inserted(*id)),
                _ => Err(LoadError::LoadFailure {
                    table: target.table_name.clone(),
                    message: format!("insert returned {} identifiers for 1 row", ids.len()),
                    attributes: attributes(),
                }),
            };
        }
        Err(e) => e,
    };

    conn.rollback_to_savepoint(savepoint).await?;
    let error = classify(target, error, attributes);
    if !error.is_recoverable() {
        return Err(error);
    }
    warn!("{}", error);

    let predicate: Vec<(String, Value)> = columns
        .iter()
        .zip(row.iter())
        .filter(|(c, _)| target.is_match_attribute(c))
        .map(|(c, v)| (c.clone(), v.clone()))
        .collect();
    debug!(
        "Looking up existing {} row matching {} attributes",
        target.table_name,
        predicate.len()
    );

    match conn
        .find_id(&target.table_name, &target.id_column, &predicate)
        .await?
    {
        Some(id) => Ok(RowOutcome::Fetched(id)),
        None => {
            let record: Map<String, Value> = predicate.into_iter().collect();
            Err(LoadError::UnresolvedConflict {
                table: target.table_name.clone(),
                attributes: Value::Object(record).to_string(),
            })
        }
    }
}
