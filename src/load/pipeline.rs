//! Whole-plan loads
//!
//! [`load_batches`] runs a [`LoadPlan`] over named batches inside a single
//! transaction. Either every stage is committed with its keys rewritten to
//! database keys, or nothing is and the first unresolved error is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{LoadError, LoadResult, ReconcilingLoader};
use crate::batch::RowBatch;
use crate::database::config::{LoadSection, LoadStrategyKind, OutputSection};
use crate::database::{DatabaseError, LoadConnection};
use crate::handler::RowSetHandler;
use crate::target::LoadPlan;

/// How stages are walked
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Each stage's whole batch, target by target
    #[default]
    Bulk,
    /// The first stage one group of `column` values at a time, with the
    /// rows of later stages that belong to each group
    Grouped { column: String },
}

impl LoadStrategy {
    pub fn from_config(section: &LoadSection) -> Self {
        match section.strategy {
            LoadStrategyKind::Bulk => LoadStrategy::Bulk,
            LoadStrategyKind::Grouped => LoadStrategy::Grouped {
                column: section.group_column.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoadStrategy::Bulk => "bulk",
            LoadStrategy::Grouped { .. } => "grouped",
        }
    }
}

/// How a target's rows were resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPath {
    #[default]
    Bulk,
    /// At least one bulk attempt fell back to insert-or-fetch
    RowByRow,
}

/// Counters for one target table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetReport {
    pub table: String,
    /// Rows handed to the insert primitive
    pub staged: usize,
    /// Rows inserted by bulk statements
    pub inserted_bulk: usize,
    /// Rows resolved by insert-or-fetch
    pub resolved_by_row: usize,
    /// Rows found already present
    pub fetched: usize,
    /// Collision swaps performed
    pub swaps: usize,
    pub path: LoadPath,
}

impl TargetReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

/// Summary of one committed load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}

impl LoadReport {
    /// Report for one table
    pub fn target(&self, table: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.table == table)
    }

    /// Rows staged over all tables
    pub fn total_staged(&self) -> usize {
        self.targets.iter().map(|t| t.staged).sum()
    }
}

/// Load named batches according to a plan, in one transaction
///
/// Batch names must match stage names. Stages without a batch are skipped.
/// On success every batch holds database keys in its key and foreign key
/// columns; on failure the transaction is rolled back and every batch is
/// returned with the keys it arrived with.
pub async fn load_batches<C: LoadConnection + ?Sized>(
    conn: &mut C,
    plan: &LoadPlan,
    batches: &mut BTreeMap<String, RowBatch>,
    strategy: &LoadStrategy,
) -> LoadResult<LoadReport> {
    plan.validate()?;
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let mut by_stage: Vec<Option<&mut RowBatch>> = plan.stages.iter().map(|_| None).collect();
    for (name, batch) in batches.iter_mut() {
        let Some(index) = plan.stages.iter().position(|s| &s.name == name) else {
            return Err(LoadError::InvalidPlan(format!(
                "Batch '{}' has no stage in the plan",
                name
            )));
        };
        for target in &plan.stages[index].targets {
            if batch.has_column(&target.local_key) {
                batch.check_keys(&target.local_key)?;
            }
        }
        by_stage[index] = Some(batch);
    }

    info!(
        "Starting {} load {} over {} stages",
        strategy.name(),
        run_id,
        plan.stages.len()
    );

    conn.begin().await?;
    let outcome = run_plan(&mut *conn, plan, &mut by_stage, strategy).await;
    let targets = match outcome {
        Ok(targets) => targets,
        Err(e) => {
            error!("Load {} failed, rolling back: {}", run_id, e);
            if let Err(rollback) = conn.rollback().await {
                warn!("Rollback after failed load also failed: {}", rollback);
            }
            restore_batches(&mut by_stage);
            return Err(e);
        }
    };

    if let Err(e) = conn.commit().await {
        error!("Commit of load {} failed: {}", run_id, e);
        restore_batches(&mut by_stage);
        return Err(e.into());
    }

    let report = LoadReport {
        run_id,
        strategy: strategy.name().to_string(),
        started_at,
        finished_at: Utc::now(),
        targets,
    };
    info!(
        "Committed load {} ({} rows staged)",
        run_id,
        report.total_staged()
    );
    Ok(report)
}

/// Undo key rewrites so no batch points at rolled back rows
fn restore_batches(by_stage: &mut [Option<&mut RowBatch>]) {
    for batch in by_stage.iter_mut().flatten() {
        batch.restore_originals();
    }
}

async fn run_plan<C: LoadConnection + ?Sized>(
    conn: &mut C,
    plan: &LoadPlan,
    by_stage: &mut [Option<&mut RowBatch>],
    strategy: &LoadStrategy,
) -> LoadResult<Vec<TargetReport>> {
    let mut loader = ReconcilingLoader::new(conn);
    let mut handlers: Vec<Option<RowSetHandler<'_>>> = by_stage
        .iter_mut()
        .map(|b| b.as_deref_mut().map(RowSetHandler::new))
        .collect();

    if let LoadStrategy::Grouped { column } = strategy {
        load_grouped(&mut loader, plan, &mut handlers, column).await?;
    }

    // Whole batches; after a grouped pass this only picks up rows no group
    // reached, since resolved rows are not staged again.
    for (index, stage) in plan.stages.iter().enumerate() {
        let Some(handler) = handlers[index].as_mut() else {
            warn!("No batch supplied for stage '{}'", stage.name);
            continue;
        };
        for (column, _) in plan.cross_stage_links(index) {
            loader.propagate(handler, &column)?;
        }
        loader.load_targets(handler, &stage.targets).await?;
    }

    Ok(loader.into_reports())
}

async fn load_grouped<C: LoadConnection + ?Sized>(
    loader: &mut ReconcilingLoader<'_, C>,
    plan: &LoadPlan,
    handlers: &mut [Option<RowSetHandler<'_>>],
    column: &str,
) -> LoadResult<()> {
    let Some(first) = handlers.first_mut().and_then(Option::as_mut) else {
        return Err(LoadError::InvalidPlan(
            "grouped loads need a batch for the first stage".to_string(),
        ));
    };
    let groups = first.original_values(column)?;
    info!("Loading {} groups of '{}'", groups.len(), column);

    // Columns later stages link through, by producing stage
    let mut linked: HashMap<usize, Vec<String>> = HashMap::new();
    for index in 1..plan.stages.len() {
        for (link, producer) in plan.cross_stage_links(index) {
            linked.entry(producer).or_default().push(link);
        }
    }

    for group in groups {
        debug!("Loading group {}={}", column, group);
        let mut link_values: HashMap<String, Vec<Value>> = HashMap::new();

        for (index, stage) in plan.stages.iter().enumerate() {
            let Some(root) = handlers[index].as_mut() else {
                continue;
            };
            let links = plan.cross_stage_links(index);
            let mut sub = if index == 0 {
                root.sub_handler(column, std::slice::from_ref(&group))?
            } else {
                let Some((link, values)) = links
                    .iter()
                    .find_map(|(link, _)| link_values.get(link).map(|v| (link, v)))
                else {
                    continue;
                };
                root.sub_handler(link, values)?
            };
            if sub.is_empty() {
                continue;
            }
            for (link, _) in &links {
                loader.propagate(&mut sub, link)?;
            }
            loader.load_targets(&mut sub, &stage.targets).await?;

            for link in linked.get(&index).into_iter().flatten() {
                let values = sub.original_values(link)?;
                link_values.entry(link.clone()).or_default().extend(values);
            }
        }
    }
    Ok(())
}

/// Write reconciled batches as JSON records
///
/// Returns the files written; nothing is written when `save_output` is off.
pub fn write_reconciled_batches(
    output: &OutputSection,
    workspace_path: &Path,
    started_at: &DateTime<Utc>,
    batches: &BTreeMap<String, RowBatch>,
) -> LoadResult<Vec<PathBuf>> {
    if !output.save_output {
        return Ok(Vec::new());
    }
    let stamp = started_at.format("%Y-%m-%dT%H%M%S").to_string();
    let mut written = Vec::new();
    for (stage, batch) in batches {
        let path = output.inserted_batch_path(workspace_path, &stamp, stage);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::IoError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let content = serde_json::to_string_pretty(&batch.to_records())
            .map_err(|e| DatabaseError::SerializationError(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| {
            DatabaseError::IoError(format!("Failed to write {}: {}", path.display(), e))
        })?;
        info!("Wrote reconciled {} batch to {}", stage, path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_strategy_from_config() {
        let mut section = LoadSection::default();
        assert_eq!(LoadStrategy::from_config(&section), LoadStrategy::Bulk);
        section.strategy = LoadStrategyKind::Grouped;
        assert_eq!(
            LoadStrategy::from_config(&section),
            LoadStrategy::Grouped {
                column: "observation_id".to_string()
            }
        );
    }

    #[test]
    fn test_report_serializes() {
        let mut target = TargetReport::new("beam");
        target.staged = 3;
        target.path = LoadPath::RowByRow;
        let report = LoadReport {
            run_id: Uuid::new_v4(),
            strategy: "bulk".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            targets: vec![target],
        };
        let text = serde_json::to_string(&report).unwrap();
        assert!(text.contains("\"row_by_row\""));
        assert_eq!(report.total_staged(), 3);
        assert!(report.target("beam").is_some());
        assert!(report.target("host").is_none());
    }

    #[test]
    fn test_write_reconciled_batches() {
        let temp = TempDir::new().unwrap();
        let mut batches = BTreeMap::new();
        batches.insert(
            "candidate".to_string(),
            RowBatch::from_json(r#"[{"candidate_id": 4, "beam_id": 9}]"#).unwrap(),
        );

        let mut output = OutputSection::default();
        output.partition_key = "2024-01-01".into();
        let written =
            write_reconciled_batches(&output, temp.path(), &Utc::now(), &batches).unwrap();
        assert_eq!(written.len(), 1);
        let name = written[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("2024-01-01_"));
        assert!(name.ends_with("_candidate_inserted.json"));

        let content = std::fs::read_to_string(&written[0]).unwrap();
        let records: Vec<Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(records[0]["beam_id"], json!(9));

        output.save_output = false;
        assert!(
            write_reconciled_batches(&output, temp.path(), &Utc::now(), &batches)
                .unwrap()
                .is_empty()
        );
    }
}
