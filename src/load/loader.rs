//! Per-target reconciliation
//!
//! [`ReconcilingLoader`] loads one target at a time from a
//! [`RowSetHandler`]: stage, bulk insert under a savepoint, and on a
//! duplicate or foreign key conflict retry row by row with
//! insert-or-fetch. Every resolved key is written back into the batch so
//! that later targets see database keys in their foreign key columns.
//!
//! Writing a resolved key back can clash with a local key that has not
//! been resolved yet. Such a row is first moved to a synthetic key above
//! every key in use, then the resolved key is written.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::insert::{insert_row_or_fetch, insert_rows, stage_rows, RowOutcome, StagedRows};
use super::pipeline::{LoadPath, TargetReport};
use super::{IdentifierMap, LoadError, LoadResult};
use crate::batch::Key;
use crate::database::LoadConnection;
use crate::handler::RowSetHandler;
use crate::target::TargetDescriptor;

/// Loads targets over one connection, keeping key mappings for the
/// lifetime of the enclosing transaction
pub struct ReconcilingLoader<'c, C: LoadConnection + ?Sized> {
    conn: &'c mut C,
    /// Identifier maps by local key column
    maps: HashMap<String, IdentifierMap>,
    /// Physical columns by table
    table_columns: HashMap<String, Vec<String>>,
    reports: Vec<TargetReport>,
    savepoints: usize,
}

impl<'c, C: LoadConnection + ?Sized> ReconcilingLoader<'c, C> {
    /// Create a loader; the caller owns the outer transaction
    pub fn new(conn: &'c mut C) -> Self {
        Self {
            conn,
            maps: HashMap::new(),
            table_columns: HashMap::new(),
            reports: Vec::new(),
            savepoints: 0,
        }
    }

    /// Identifier map of the target whose local key is `local_key`
    pub fn identifier_map(&self, local_key: &str) -> Option<&IdentifierMap> {
        self.maps.get(local_key)
    }

    /// Per-target reports in first-load order
    pub fn reports(&self) -> &[TargetReport] {
        &self.reports
    }

    pub fn into_reports(self) -> Vec<TargetReport> {
        self.reports
    }

    /// Load each target in order from the same handler
    pub async fn load_targets(
        &mut self,
        handler: &mut RowSetHandler<'_>,
        targets: &[TargetDescriptor],
    ) -> LoadResult<()> {
        for target in targets {
            self.load_target(handler, target).await?;
        }
        Ok(())
    }

    /// Rewrite a foreign key column from the keys resolved so far
    ///
    /// Values with no mapping pass through unchanged.
    pub fn propagate(&self, handler: &mut RowSetHandler<'_>, column: &str) -> LoadResult<usize> {
        let Some(map) = self.maps.get(column) else {
            return Ok(0);
        };
        let changed = handler.remap_from_originals(column, |key| map.get(key))?;
        debug!("Rewrote {} '{}' values from {} mappings", changed, column, map.len());
        Ok(changed)
    }

    /// Load the handler's rows of one target and reconcile their keys
    pub async fn load_target(
        &mut self,
        handler: &mut RowSetHandler<'_>,
        target: &TargetDescriptor,
    ) -> LoadResult<()> {
        if !handler.batch().has_column(&target.local_key) {
            warn!(
                "Batch has no '{}' column, skipping {}",
                target.local_key, target.table_name
            );
            return Ok(());
        }
        let columns = self.columns_of(&target.table_name).await?;
        let staged = {
            let map = self.maps.entry(target.local_key.clone()).or_default();
            stage_rows(handler, target, &columns, map)?
        };
        self.report_mut(&target.table_name).staged += staged.len();

        if staged.is_empty() {
            debug!("Nothing to load into {}", target.table_name);
            return Ok(());
        }
        info!("Loading {} rows into {}", staged.len(), target.table_name);

        let savepoint = self.next_savepoint();
        self.conn.savepoint(&savepoint).await?;
        match insert_rows(&mut *self.conn, target, &staged).await {
            Ok(ids) => {
                self.conn.release_savepoint(&savepoint).await?;
                let mut current = staged.local_keys.clone();
                for (i, id) in ids.into_iter().enumerate() {
                    self.reconcile_row(handler, target, &staged, &mut current, i, id)
                        .await?;
                }
                let report = self.report_mut(&target.table_name);
                report.inserted_bulk += staged.len();
                info!("Bulk inserted {} rows into {}", staged.len(), target.table_name);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                self.conn.rollback_to_savepoint(&savepoint).await?;
                warn!("Bulk insert failed, loading {} row by row: {}", target.table_name, e);
                self.report_mut(&target.table_name).path = LoadPath::RowByRow;
                self.load_row_by_row(handler, target, &staged).await
            }
            Err(e) => {
                self.conn.rollback_to_savepoint(&savepoint).await?;
                Err(e)
            }
        }
    }

    async fn load_row_by_row(
        &mut self,
        handler: &mut RowSetHandler<'_>,
        target: &TargetDescriptor,
        staged: &StagedRows,
    ) -> LoadResult<()> {
        let mut current = staged.local_keys.clone();
        let mut fetched = 0;
        for i in 0..staged.len() {
            let savepoint = self.next_savepoint();
            let outcome = insert_row_or_fetch(
                &mut *self.conn,
                target,
                &staged.columns,
                &staged.rows[i],
                &savepoint,
            )
            .await?;
            if let RowOutcome::Fetched(id) = outcome {
                debug!("{} key {} already exists as {}", target.table_name, current[i], id);
                fetched += 1;
            }
            self.reconcile_row(handler, target, staged, &mut current, i, outcome.id())
                .await?;
        }

        let report = self.report_mut(&target.table_name);
        report.resolved_by_row += staged.len();
        report.fetched += fetched;
        info!(
            "Resolved {} rows of {} row by row ({} already present)",
            staged.len(),
            target.table_name,
            fetched
        );
        Ok(())
    }

    /// Point staged row `i` at database key `db`
    ///
    /// `current` tracks the present local key of every staged row and is
    /// updated along with the batch.
    async fn reconcile_row(
        &mut self,
        handler: &mut RowSetHandler<'_>,
        target: &TargetDescriptor,
        staged: &StagedRows,
        current: &mut [Key],
        i: usize,
        db: Key,
    ) -> LoadResult<()> {
        let key_column = target.local_key.as_str();
        let local = current[i];

        if db != local {
            let merges = self
                .maps
                .get(key_column)
                .is_some_and(|map| map.contains_db_id(db));
            if !merges && handler.parent_keys(key_column)?.contains(&db) {
                let swap_key = self.swap_key(handler, target).await?;
                warn!(
                    "Inserted key {}={} exists in local batch. Swapping to {}",
                    key_column, db, swap_key
                );
                handler.update_value(key_column, db, swap_key)?;
                rename(current, db, swap_key);
                self.report_mut(&target.table_name).swaps += 1;
            }
            handler.update_value(key_column, local, db)?;
            rename(current, local, db);
        }

        let map = self.maps.entry(target.local_key.clone()).or_default();
        if !map.insert(staged.original_keys[i], db) {
            return Err(LoadError::LoadFailure {
                table: target.table_name.clone(),
                message: format!(
                    "local key {} was resolved twice",
                    staged.original_keys[i]
                ),
                attributes: serde_json::Value::Object(staged.attributes(i)).to_string(),
            });
        }
        Ok(())
    }

    /// A key above every row in the table and every key in the batch
    async fn swap_key(
        &mut self,
        handler: &RowSetHandler<'_>,
        target: &TargetDescriptor,
    ) -> LoadResult<Key> {
        let in_table = self.conn.count_rows(&target.table_name).await?;
        let in_batch = handler.max_parent_key(&target.local_key)?.unwrap_or(0);
        Ok(in_table.max(in_batch) + 1)
    }

    async fn columns_of(&mut self, table: &str) -> LoadResult<Vec<String>> {
        if let Some(columns) = self.table_columns.get(table) {
            return Ok(columns.clone());
        }
        let columns = self.conn.table_columns(table).await?;
        if columns.is_empty() {
            return Err(LoadError::LoadFailure {
                table: table.to_string(),
                message: "table does not exist or has no columns".to_string(),
                attributes: "{}".to_string(),
            });
        }
        self.table_columns.insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    fn next_savepoint(&mut self) -> String {
        self.savepoints += 1;
        format!("maltopuft_sp_{}", self.savepoints)
    }

    fn report_mut(&mut self, table: &str) -> &mut TargetReport {
        let index = match self.reports.iter().position(|r| r.table == table) {
            Some(index) => index,
            None => {
                self.reports.push(TargetReport::new(table));
                self.reports.len() - 1
            }
        };
        &mut self.reports[index]
    }
}

fn rename(keys: &mut [Key], from: Key, to: Key) {
    for key in keys.iter_mut().filter(|k| **k == from) {
        *key = to;
    }
}
