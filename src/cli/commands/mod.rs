//! CLI command implementations

pub mod init;
pub mod load;
pub mod targets;

use std::path::Path;

use crate::cli::error::CliError;
use crate::target::LoadPlan;

/// Resolve `--plan`: a built-in plan name or a TOML file
pub fn resolve_plan(plan: &str) -> Result<LoadPlan, CliError> {
    if let Some(builtin) = LoadPlan::builtin(plan) {
        return Ok(builtin);
    }
    let path = Path::new(plan);
    if !path.exists() {
        return Err(CliError::InvalidArgument(format!(
            "'{}' is neither a built-in plan (meertrap, atnf) nor a plan file",
            plan
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| CliError::FileReadError(path.to_path_buf(), e.to_string()))?;
    Ok(LoadPlan::from_toml(&content)?)
}
