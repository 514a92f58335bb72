//! Print a load plan

use super::resolve_plan;
use crate::cli::error::CliError;

/// Render a plan as TOML after validating it
pub fn handle_targets(plan: &str) -> Result<String, CliError> {
    let plan = resolve_plan(plan)?;
    plan.validate()?;
    Ok(plan.to_toml()?)
}
