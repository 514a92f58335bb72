//! CLI-specific error types

use std::path::PathBuf;
use thiserror::Error;

use crate::batch::BatchError;
use crate::database::DatabaseError;
use crate::load::LoadError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read file {0}: {1}")]
    FileReadError(PathBuf, String),

    #[error("Failed to write file {0}: {1}")]
    FileWriteError(PathBuf, String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid batch {0}: {1}")]
    InvalidBatch(PathBuf, BatchError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Load failed: {0}")]
    LoadError(#[from] LoadError),

    #[error("IO error: {0}")]
    IoError(String),
}
