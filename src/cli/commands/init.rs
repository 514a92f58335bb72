//! Write a sample `.maltopuft.toml`

use std::path::PathBuf;

use crate::cli::error::CliError;
use crate::database::config::{CONFIG_FILENAME, LoaderConfig, sample_config};

/// Init command arguments
#[derive(Debug, Clone)]
pub struct InitArgs {
    /// Working directory
    pub dir: PathBuf,
    /// Overwrite an existing config
    pub force: bool,
}

pub fn handle_init(args: &InitArgs) -> Result<PathBuf, CliError> {
    if LoaderConfig::exists(&args.dir) && !args.force {
        return Err(CliError::InvalidArgument(format!(
            "{} already exists in {} (use --force to overwrite)",
            CONFIG_FILENAME,
            args.dir.display()
        )));
    }
    std::fs::create_dir_all(&args.dir)
        .map_err(|e| CliError::FileWriteError(args.dir.clone(), e.to_string()))?;
    let path = args.dir.join(CONFIG_FILENAME);
    std::fs::write(&path, sample_config())
        .map_err(|e| CliError::FileWriteError(path.clone(), e.to_string()))?;
    Ok(path)
}
