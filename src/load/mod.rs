//! Reconciling load of row batches into MALTOPUFT tables
//!
//! - [`insert`]: the insert primitive and row-level insert-or-fetch
//! - [`identifier_map`]: local key to database key bookkeeping
//! - [`loader`]: per-target bulk load with row-by-row fallback
//! - [`pipeline`]: whole-plan loads inside one transaction, reports and
//!   audit artifacts

pub mod identifier_map;
pub mod insert;
pub mod loader;
pub mod pipeline;

pub use identifier_map::IdentifierMap;
pub use insert::{StagedRows, insert_row_or_fetch, insert_rows, stage_rows};
pub use loader::ReconcilingLoader;
pub use pipeline::{
    LoadPath, LoadReport, LoadStrategy, TargetReport, load_batches, write_reconciled_batches,
};

use crate::batch::BatchError;
use crate::database::DatabaseError;

/// Error type for load operations
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A row duplicates one already in the table
    #[error("Duplicate insert into {table}: {message}")]
    DuplicateInsert { table: String, message: String },

    /// A row references a key missing from the referenced table
    #[error("Foreign key violation in {table}: {message}")]
    ForeignKey { table: String, message: String },

    /// A conflict was reported but no existing row matches the attributes
    #[error(
        "Conflict in {table} has no matching row for attributes {attributes}; \
         nothing was committed"
    )]
    UnresolvedConflict { table: String, attributes: String },

    /// Any other failure while writing a target
    #[error("Failed to load {table}: {message} (attributes {attributes})")]
    LoadFailure {
        table: String,
        message: String,
        attributes: String,
    },

    /// The load plan cannot be executed
    #[error("Invalid load plan: {0}")]
    InvalidPlan(String),

    /// Batch does not have the expected shape
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Database error outside of a target insert
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl LoadError {
    /// Whether the row-by-row fallback can resolve this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LoadError::DuplicateInsert { .. } | LoadError::ForeignKey { .. }
        )
    }
}

/// Result type for load operations
pub type LoadResult<T> = Result<T, LoadError>;
