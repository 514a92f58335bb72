//! SQLite database backend implementation
//!
//! Embedded backend used for local runs and tests. Foreign keys are
//! enforced on every connection. Bulk inserts run one prepared
//! `INSERT ... RETURNING` per row, which keeps generated identifiers in
//! parameter order.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params_from_iter};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{
    ConstraintKind, ConstraintViolation, DatabaseError, DatabaseResult, LoadConnection, quote_ident,
};
use crate::batch::Key;

/// SQLite connection
pub struct SqliteConnection {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    conn: Connection,
}

impl SqliteConnection {
    /// Open a file-based database, creating it if needed
    pub fn open(db_path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to open SQLite: {}", e))
        })?;
        Self::configure(conn, Some(path))
    }

    /// Open a private in-memory database
    pub fn in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to create in-memory SQLite: {}", e))
        })?;
        Self::configure(conn, None)
    }

    fn configure(conn: Connection, db_path: Option<PathBuf>) -> DatabaseResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON").map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to enable foreign keys: {}", e))
        })?;
        Ok(Self { db_path, conn })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }
}

/// Bind a JSON cell as an SQLite value
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Columns named in "UNIQUE constraint failed: t.a, t.b"
fn constrained_columns(message: &str) -> Vec<String> {
    message
        .split_once("failed:")
        .map(|(_, list)| {
            list.split(',')
                .map(|c| {
                    let c = c.trim();
                    c.rsplit_once('.').map_or(c, |(_, column)| column).to_string()
                })
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Classify an SQLite error, keeping constraint details
fn map_error(context: &str, error: rusqlite::Error) -> DatabaseError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &error
        && failure.code == ErrorCode::ConstraintViolation
    {
        let message = message.clone().unwrap_or_else(|| error.to_string());
        let kind = match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ConstraintKind::PrimaryKey,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => ConstraintKind::Unique,
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
            _ => ConstraintKind::Other,
        };
        let columns = match kind {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => constrained_columns(&message),
            _ => Vec::new(),
        };
        return ConstraintViolation::new(kind, message)
            .with_columns(columns)
            .into();
    }
    DatabaseError::QueryFailed(format!("{}: {}", context, error))
}

#[async_trait(?Send)]
impl LoadConnection for SqliteConnection {
    async fn execute_batch(&mut self, sql: &str) -> DatabaseResult<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| map_error("Execute failed", e))
    }

    async fn table_columns(&mut self, table: &str) -> DatabaseResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(|e| map_error("Failed to read table info", e))?;
        let columns = stmt
            .query_map([table], |row| row.get::<_, String>(0))
            .map_err(|e| map_error("Failed to read table info", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_error("Failed to read table info", e))?;
        Ok(columns)
    }

    async fn insert_returning_ids(
        &mut self,
        table: &str,
        id_column: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> DatabaseResult<Vec<Key>> {
        let sql = if columns.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                quote_ident(table),
                quote_ident(id_column)
            )
        } else {
            let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                quote_ident(table),
                names.join(", "),
                placeholders.join(", "),
                quote_ident(id_column)
            )
        };
        debug!("{} ({} rows)", sql, rows.len());

        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| map_error("Failed to prepare insert", e))?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != columns.len() {
                return Err(DatabaseError::InvalidInput(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            let id = stmt
                .query_row(params_from_iter(row.iter().map(to_sql)), |r| r.get::<_, i64>(0))
                .map_err(|e| map_error("Insert failed", e))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find_id(
        &mut self,
        table: &str,
        id_column: &str,
        predicate: &[(String, Value)],
    ) -> DatabaseResult<Option<Key>> {
        let mut sql = format!(
            "SELECT {} FROM {}",
            quote_ident(id_column),
            quote_ident(table)
        );
        if !predicate.is_empty() {
            let conditions: Vec<String> = predicate
                .iter()
                .enumerate()
                .map(|(i, (column, _))| format!("{} IS ?{}", quote_ident(column), i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT 1", quote_ident(id_column)));

        self.conn
            .query_row(
                &sql,
                params_from_iter(predicate.iter().map(|(_, v)| to_sql(v))),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| map_error("Lookup failed", e))
    }

    async fn count_rows(&mut self, table: &str) -> DatabaseResult<i64> {
        self.conn
            .query_row(
                &format!("SELECT count(*) FROM {}", quote_ident(table)),
                [],
                |r| r.get::<_, i64>(0),
            )
            .map_err(|e| map_error("Count failed", e))
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn fixture() -> SqliteConnection {
        let mut conn = SqliteConnection::in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE host (
                id INTEGER PRIMARY KEY,
                hostname TEXT NOT NULL,
                port INTEGER,
                CONSTRAINT host_hostname_key UNIQUE (hostname)
            );
            CREATE TABLE beam (
                id INTEGER PRIMARY KEY,
                number INTEGER NOT NULL,
                host_id INTEGER NOT NULL REFERENCES host (id)
            );",
        )
        .await
        .unwrap();
        conn
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_insert_returns_ids_in_order() {
        let mut conn = fixture().await;
        let ids = conn
            .insert_returning_ids(
                "host",
                "id",
                &cols(&["hostname", "port"]),
                &[
                    vec![json!("tpn-0-1"), json!(7148)],
                    vec![json!("tpn-0-2"), Value::Null],
                    vec![json!("tpn-0-3"), json!(7148)],
                ],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(conn.count_rows("host").await.unwrap(), 3);
        assert_eq!(
            conn.table_columns("host").await.unwrap(),
            vec!["id", "hostname", "port"]
        );
        assert!(conn.table_columns("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_violation_reports_columns() {
        let mut conn = fixture().await;
        let row = vec![vec![json!("tpn-0-1"), json!(1)]];
        conn.insert_returning_ids("host", "id", &cols(&["hostname", "port"]), &row)
            .await
            .unwrap();
        let err = conn
            .insert_returning_ids("host", "id", &cols(&["hostname", "port"]), &row)
            .await
            .unwrap_err();
        let violation = err.constraint_violation().unwrap();
        assert_eq!(violation.kind, ConstraintKind::Unique);
        assert_eq!(violation.columns, vec!["hostname"]);
    }

    #[tokio::test]
    async fn test_foreign_key_violation() {
        let mut conn = fixture().await;
        let err = conn
            .insert_returning_ids(
                "beam",
                "id",
                &cols(&["number", "host_id"]),
                &[vec![json!(1), json!(99)]],
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.constraint_violation().map(|v| v.kind),
            Some(ConstraintKind::ForeignKey)
        );
    }

    #[tokio::test]
    async fn test_find_id_matches_null() {
        let mut conn = fixture().await;
        conn.insert_returning_ids(
            "host",
            "id",
            &cols(&["hostname", "port"]),
            &[vec![json!("a"), json!(1)], vec![json!("b"), Value::Null]],
        )
        .await
        .unwrap();

        let found = conn
            .find_id(
                "host",
                "id",
                &[("hostname".into(), json!("b")), ("port".into(), Value::Null)],
            )
            .await
            .unwrap();
        assert_eq!(found, Some(2));

        let missing = conn
            .find_id("host", "id", &[("hostname".into(), json!("c"))])
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_earlier_work() {
        let mut conn = fixture().await;
        conn.begin().await.unwrap();
        conn.insert_returning_ids("host", "id", &cols(&["hostname"]), &[vec![json!("a")]])
            .await
            .unwrap();
        conn.savepoint("sp_1").await.unwrap();
        conn.insert_returning_ids("host", "id", &cols(&["hostname"]), &[vec![json!("b")]])
            .await
            .unwrap();
        conn.rollback_to_savepoint("sp_1").await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(conn.count_rows("host").await.unwrap(), 1);
    }

    #[test]
    fn test_constrained_columns() {
        assert_eq!(
            constrained_columns("UNIQUE constraint failed: beam.observation_id, beam.number"),
            vec!["observation_id", "number"]
        );
        assert!(constrained_columns("FOREIGN KEY constraint failed").is_empty());
    }
}
