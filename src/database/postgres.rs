//! PostgreSQL database backend implementation
//!
//! Talks to the production MALTOPUFT database over a single
//! `tokio_postgres` session. Rows travel as one JSON document per
//! statement and are expanded server side with `json_populate_recordset`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_postgres::error::SqlState;
use tracing::{debug, error};

use super::{
    ConstraintKind, ConstraintViolation, DatabaseError, DatabaseResult, LoadConnection, quote_ident,
};
use crate::batch::Key;

/// PostgreSQL connection
pub struct PostgresConnection {
    /// Connection string
    connection_string: String,
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    /// Connect and spawn the connection driver task
    pub async fn connect(connection_string: &str) -> DatabaseResult<Self> {
        let (client, connection) =
            tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Failed to connect to PostgreSQL: {}",
                        e
                    ))
                })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            connection_string: connection_string.to_string(),
            client,
        })
    }

    /// Get the connection string with the password masked
    pub fn connection_string_masked(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@')
            && let Some(colon_pos) = self.connection_string[..at_pos].rfind(':')
        {
            let prefix = &self.connection_string[..colon_pos + 1];
            let suffix = &self.connection_string[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
        self.connection_string.clone()
    }
}

/// Integral floats become integers so they populate integer columns
fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64))
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn records(columns: &[String], rows: &[Vec<Value>]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                let record: Map<String, Value> = columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(normalize))
                    .collect();
                Value::Object(record)
            })
            .collect(),
    )
}

/// Insert rows expanded from `$1` in array order
///
/// Identifiers come from the table's sequence, so sorting the returned
/// identifiers restores array order.
fn insert_sql(table: &str, id_column: &str, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let selected: Vec<String> = columns
        .iter()
        .map(|c| format!("r.{}", quote_ident(c)))
        .collect();
    format!(
        "INSERT INTO {table} ({names}) \
         SELECT {selected} FROM json_populate_recordset(NULL::{table}, $1::json) \
         WITH ORDINALITY AS r \
         ORDER BY r.ordinality \
         RETURNING {id}::bigint",
        table = quote_ident(table),
        names = names.join(", "),
        selected = selected.join(", "),
        id = quote_ident(id_column),
    )
}

/// Null-safe lookup of a row equal to the record in `$1`
fn find_sql(table: &str, id_column: &str, columns: &[String]) -> String {
    let id = quote_ident(id_column);
    let mut sql = format!(
        "SELECT t.{id}::bigint FROM {table} AS t, json_populate_record(NULL::{table}, $1::json) AS r",
        id = id,
        table = quote_ident(table),
    );
    if !columns.is_empty() {
        let conditions: Vec<String> = columns
            .iter()
            .map(|c| {
                let c = quote_ident(c);
                format!("t.{c} IS NOT DISTINCT FROM r.{c}")
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY t.{} LIMIT 1", id));
    sql
}

/// Columns named in a detail like "Key (a, b)=(1, 2) already exists."
fn detail_columns(detail: &str) -> Vec<String> {
    detail
        .strip_prefix("Key (")
        .and_then(|rest| rest.split_once(")="))
        .map(|(list, _)| {
            list.split(',')
                .map(|c| c.trim().trim_matches('"').to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Classify a PostgreSQL error, keeping constraint details
fn map_error(context: &str, error: tokio_postgres::Error) -> DatabaseError {
    let Some(db_error) = error.as_db_error() else {
        return DatabaseError::QueryFailed(format!("{}: {}", context, error));
    };
    let code = db_error.code();
    let kind = if *code == SqlState::UNIQUE_VIOLATION {
        match db_error.constraint() {
            Some(name) if name.ends_with("_pkey") => ConstraintKind::PrimaryKey,
            _ => ConstraintKind::Unique,
        }
    } else if *code == SqlState::FOREIGN_KEY_VIOLATION {
        ConstraintKind::ForeignKey
    } else if *code == SqlState::NOT_NULL_VIOLATION || *code == SqlState::CHECK_VIOLATION {
        ConstraintKind::Other
    } else {
        return DatabaseError::QueryFailed(format!("{}: {}", context, db_error));
    };

    let mut violation = ConstraintViolation::new(kind, db_error.message());
    if let Some(name) = db_error.constraint() {
        violation = violation.with_constraint(name);
    }
    if let Some(detail) = db_error.detail() {
        violation = violation.with_columns(detail_columns(detail));
    }
    violation.into()
}

#[async_trait(?Send)]
impl LoadConnection for PostgresConnection {
    async fn execute_batch(&mut self, sql: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| map_error("Execute failed", e))
    }

    async fn table_columns(&mut self, table: &str) -> DatabaseResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| map_error("Failed to read table columns", e))?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn insert_returning_ids(
        &mut self,
        table: &str,
        id_column: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> DatabaseResult<Vec<Key>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if columns.is_empty() {
            let sql = format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}::bigint",
                quote_ident(table),
                quote_ident(id_column)
            );
            let mut ids = Vec::with_capacity(rows.len());
            for _ in rows {
                let row = self
                    .client
                    .query_one(sql.as_str(), &[])
                    .await
                    .map_err(|e| map_error("Insert failed", e))?;
                ids.push(row.get::<_, i64>(0));
            }
            return Ok(ids);
        }

        let sql = insert_sql(table, id_column, columns);
        let payload = records(columns, rows);
        debug!("{} ({} rows)", sql, rows.len());

        let returned = self
            .client
            .query(sql.as_str(), &[&payload])
            .await
            .map_err(|e| map_error("Insert failed", e))?;
        let mut ids: Vec<Key> = returned.iter().map(|row| row.get::<_, i64>(0)).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn find_id(
        &mut self,
        table: &str,
        id_column: &str,
        predicate: &[(String, Value)],
    ) -> DatabaseResult<Option<Key>> {
        let columns: Vec<String> = predicate.iter().map(|(c, _)| c.clone()).collect();
        let record: Map<String, Value> = predicate
            .iter()
            .map(|(c, v)| (c.clone(), normalize(v)))
            .collect();
        let payload = Value::Object(record);
        let row = self
            .client
            .query_opt(find_sql(table, id_column, &columns).as_str(), &[&payload])
            .await
            .map_err(|e| map_error("Lookup failed", e))?;
        Ok(row.map(|r| r.get::<_, i64>(0)))
    }

    async fn count_rows(&mut self, table: &str) -> DatabaseResult<i64> {
        let row = self
            .client
            .query_one(
                format!("SELECT count(*) FROM {}", quote_ident(table)).as_str(),
                &[],
            )
            .await
            .map_err(|e| map_error("Count failed", e))?;
        Ok(row.get::<_, i64>(0))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
