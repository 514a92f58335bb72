//! Database connection abstraction for reconciling loads
//!
//! This module provides the connection seam the loader talks to:
//! - SQLite: Embedded database (default), used for local runs and tests
//! - PostgreSQL: The production MALTOPUFT database
//!
//! A connection is a single live session. Transaction and savepoint
//! boundaries are controlled by the caller through the trait methods; the
//! connection never commits on its own.

use async_trait::async_trait;
use serde_json::Value;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub mod config;

#[cfg(feature = "sqlite-backend")]
pub use self::sqlite::SqliteConnection;

#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresConnection;

pub use config::{DatabaseBackendType, LoaderConfig};

use crate::batch::Key;

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction or savepoint control failed
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// An integrity constraint rejected a statement
    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Backend was not compiled into this build
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl DatabaseError {
    /// The constraint violation behind this error, if any
    pub fn constraint_violation(&self) -> Option<&ConstraintViolation> {
        match self {
            DatabaseError::Constraint(violation) => Some(violation),
            _ => None,
        }
    }
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Kind of integrity constraint that was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Primary key collision
    PrimaryKey,
    /// Unique constraint or unique index collision
    Unique,
    /// Referenced row does not exist
    ForeignKey,
    /// NOT NULL, CHECK and anything else
    Other,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintKind::PrimaryKey => write!(f, "primary key"),
            ConstraintKind::Unique => write!(f, "unique"),
            ConstraintKind::ForeignKey => write!(f, "foreign key"),
            ConstraintKind::Other => write!(f, "integrity"),
        }
    }
}

/// A classified integrity error reported by a backend
///
/// Backends fill in whatever identifies the violated constraint: PostgreSQL
/// reports the constraint name, SQLite reports the constrained columns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} constraint violated: {message}")]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub constraint: Option<String>,
    pub columns: Vec<String>,
    pub message: String,
}

impl ConstraintViolation {
    pub fn new(kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            constraint: None,
            columns: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_constraint(mut self, name: impl Into<String>) -> Self {
        self.constraint = Some(name.into());
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }
}

/// A single database session the loader drives
///
/// Implementations issue plain SQL for transaction control so the same
/// savepoint discipline works on every backend.
#[async_trait(?Send)]
pub trait LoadConnection {
    /// Execute one or more statements that return no rows
    async fn execute_batch(&mut self, sql: &str) -> DatabaseResult<()>;

    /// Open the outer transaction
    async fn begin(&mut self) -> DatabaseResult<()> {
        self.execute_batch("BEGIN")
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("BEGIN failed: {}", e)))
    }

    /// Commit the outer transaction
    async fn commit(&mut self) -> DatabaseResult<()> {
        self.execute_batch("COMMIT")
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("COMMIT failed: {}", e)))
    }

    /// Roll back the outer transaction
    async fn rollback(&mut self) -> DatabaseResult<()> {
        self.execute_batch("ROLLBACK")
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("ROLLBACK failed: {}", e)))
    }

    /// Open a nested transaction
    async fn savepoint(&mut self, name: &str) -> DatabaseResult<()> {
        self.execute_batch(&format!("SAVEPOINT {}", quote_ident(name)))
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("SAVEPOINT {}: {}", name, e)))
    }

    /// Keep the work done since the savepoint
    async fn release_savepoint(&mut self, name: &str) -> DatabaseResult<()> {
        self.execute_batch(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("RELEASE {}: {}", name, e)))
    }

    /// Discard the work done since the savepoint, then drop it
    async fn rollback_to_savepoint(&mut self, name: &str) -> DatabaseResult<()> {
        let ident = quote_ident(name);
        self.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {ident}; RELEASE SAVEPOINT {ident}"
        ))
        .await
        .map_err(|e| DatabaseError::TransactionFailed(format!("ROLLBACK TO {}: {}", name, e)))
    }

    /// Column names of a physical table
    async fn table_columns(&mut self, table: &str) -> DatabaseResult<Vec<String>>;

    /// Insert rows and return the generated identifiers in parameter order
    ///
    /// `rows[i]` holds one value per entry of `columns`. The returned vector
    /// has the same length as `rows` and its i-th id belongs to `rows[i]`.
    async fn insert_returning_ids(
        &mut self,
        table: &str,
        id_column: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> DatabaseResult<Vec<Key>>;

    /// Identifier of the first row whose columns equal the predicate values
    ///
    /// NULL predicate values match NULL column values.
    async fn find_id(
        &mut self,
        table: &str,
        id_column: &str,
        predicate: &[(String, Value)],
    ) -> DatabaseResult<Option<Key>>;

    /// Number of rows currently in a table
    async fn count_rows(&mut self, table: &str) -> DatabaseResult<i64>;

    /// Backend type name ("sqlite" or "postgres")
    fn backend_type(&self) -> &'static str;
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Open the connection described by a configuration
///
/// Relative SQLite paths are resolved against `workspace_path`.
pub async fn open_connection(
    config: &LoaderConfig,
    workspace_path: &std::path::Path,
) -> DatabaseResult<Box<dyn LoadConnection>> {
    match config.database.backend {
        DatabaseBackendType::Sqlite => {
            #[cfg(feature = "sqlite-backend")]
            {
                let path = config.sqlite_path(workspace_path);
                Ok(Box::new(SqliteConnection::open(path)?))
            }
            #[cfg(not(feature = "sqlite-backend"))]
            {
                let _ = workspace_path;
                Err(DatabaseError::UnsupportedBackend(
                    "sqlite (build with the sqlite-backend feature)".to_string(),
                ))
            }
        }
        DatabaseBackendType::Postgres => {
            let _ = workspace_path;
            let url = config.postgres_uri().ok_or_else(|| {
                DatabaseError::ConfigError(
                    "postgres backend selected but no connection_string is set".to_string(),
                )
            })?;
            #[cfg(feature = "postgres-backend")]
            {
                Ok(Box::new(PostgresConnection::connect(url).await?))
            }
            #[cfg(not(feature = "postgres-backend"))]
            {
                let _ = url;
                Err(DatabaseError::UnsupportedBackend(
                    "postgres (build with the postgres-backend feature)".to_string(),
                ))
            }
        }
    }
}
