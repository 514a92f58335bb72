//! MALTOPUFT loader - reconciling bulk loads of observation metadata and
//! single pulse candidates
//!
//! Provides:
//! - Target descriptors and ordered load plans (MeerTRAP and ATNF built in)
//! - Row batches with hierarchical views for per-observation reconciliation
//! - A bulk insert path with row-by-row insert-or-fetch fallback
//! - Local to database key remapping across dependent tables
//! - SQLite and PostgreSQL connections with savepoint support

pub mod batch;
#[cfg(feature = "cli")]
pub mod cli;
pub mod database;
pub mod handler;
pub mod load;
pub mod target;

// Re-export commonly used types
pub use batch::{BatchError, Key, RowBatch};
pub use database::{
    ConstraintKind, ConstraintViolation, DatabaseError, DatabaseResult, LoadConnection,
    LoaderConfig, open_connection,
};
pub use handler::RowSetHandler;
pub use load::{
    IdentifierMap, LoadError, LoadPath, LoadReport, LoadResult, LoadStrategy, ReconcilingLoader,
    TargetReport, load_batches, write_reconciled_batches,
};
pub use target::{LoadPlan, Stage, TargetDescriptor, UniqueConstraint};

#[cfg(feature = "sqlite-backend")]
pub use database::SqliteConnection;

#[cfg(feature = "postgres-backend")]
pub use database::PostgresConnection;
