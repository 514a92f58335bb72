//! Load JSON record batches into the configured database

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use super::resolve_plan;
use crate::batch::RowBatch;
use crate::cli::error::CliError;
use crate::database::config::{LoadStrategyKind, LoaderConfig};
use crate::database::open_connection;
use crate::load::{LoadReport, LoadStrategy, load_batches, write_reconciled_batches};

/// Load command arguments
#[derive(Debug, Clone)]
pub struct LoadArgs {
    /// Built-in plan name or plan file
    pub plan: String,
    /// Stage name and JSON file for each batch
    pub batches: Vec<(String, PathBuf)>,
    /// Overrides `[load] strategy`
    pub strategy: Option<String>,
    /// Overrides `[load] group_column`
    pub group_column: Option<String>,
    /// Working directory holding `.maltopuft.toml`
    pub dir: PathBuf,
}

/// Parse a `STAGE=FILE` argument
pub fn parse_batch_arg(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((stage, file)) if !stage.is_empty() && !file.is_empty() => {
            Ok((stage.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected STAGE=FILE, got '{}'", arg)),
    }
}

fn read_batch(path: &Path) -> Result<RowBatch, CliError> {
    if !path.exists() {
        return Err(CliError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| CliError::FileReadError(path.to_path_buf(), e.to_string()))?;
    RowBatch::from_json(&content).map_err(|e| CliError::InvalidBatch(path.to_path_buf(), e))
}

/// Run a load and write the reconciled batches
pub fn handle_load(args: &LoadArgs) -> Result<LoadReport, CliError> {
    let mut config = LoaderConfig::load(&args.dir)?;
    if let Some(strategy) = &args.strategy {
        config.load.strategy = strategy
            .parse::<LoadStrategyKind>()
            .map_err(CliError::InvalidArgument)?;
    }
    if let Some(column) = &args.group_column {
        config.load.group_column = column.clone();
    }

    let plan = resolve_plan(&args.plan)?;
    let strategy = LoadStrategy::from_config(&config.load);

    let mut batches = BTreeMap::new();
    for (stage, path) in &args.batches {
        let batch = read_batch(path)?;
        info!("Read {} rows for stage '{}' from {}", batch.len(), stage, path.display());
        if batches.insert(stage.clone(), batch).is_some() {
            return Err(CliError::InvalidArgument(format!(
                "stage '{}' was given more than one batch",
                stage
            )));
        }
    }

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))?;

    let report = rt.block_on(async {
        let mut conn = open_connection(&config, &args.dir).await?;
        info!("Connected to {} database", conn.backend_type());
        let report = load_batches(conn.as_mut(), &plan, &mut batches, &strategy).await?;
        Ok::<_, CliError>(report)
    })?;

    let written =
        write_reconciled_batches(&config.output, &args.dir, &report.started_at, &batches)?;
    for path in written {
        info!("Saved {}", path.display());
    }
    Ok(report)
}
