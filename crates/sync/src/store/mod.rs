//! Target relational store.
//!
//! - [`TargetConnector`] is the injected query interface (`query`, `execute`,
//!   `introspect_schema`, `test_connection`, `close`); [`PgConnector`] is the
//!   `PostgreSQL` implementation
//! - [`TargetWriter`] is what the sync engine writes through: keyed upserts,
//!   stale-key deletion, webhook deletes and lookup loads; [`SqlWriter`]
//!   implements it over any connector

pub mod postgres;
pub mod sql;
pub mod writer;

pub use postgres::PgConnector;
pub use writer::{SqlWriter, TargetWriter, UpsertOutcome};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One result row as a JSON object.
pub type JsonRow = serde_json::Map<String, Value>;

/// Errors from the target store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row came back in an unexpected shape.
    #[error("unexpected row: {0}")]
    Decode(String),

    /// Identifier cannot be quoted.
    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Target table does not exist.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Mapping writes a column the table does not have.
    #[error("unknown column '{column}' on table {table}")]
    UnknownColumn {
        /// Target table.
        table: String,
        /// Missing column.
        column: String,
    },
}

/// A column as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    /// SQL type, usable in a cast (`numeric(10,2)`, `text[]`).
    pub data_type: String,
    pub nullable: bool,
}

/// A table as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Look up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `schema.name`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Query interface to the target database.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Run a statement that yields rows (including DML with `RETURNING`).
    ///
    /// Parameters are bound as text; JSON null binds SQL `NULL`.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<JsonRow>, StoreError>;

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StoreError>;

    /// Every user table and its columns.
    async fn introspect_schema(&self) -> Result<Vec<TableSchema>, StoreError>;

    /// One table (`schema.table` or `table` in `public`), if it exists.
    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let (schema, name) = sql::split_table(table);
        Ok(self
            .introspect_schema()
            .await?
            .into_iter()
            .find(|t| t.schema == schema && t.name == name))
    }

    /// Cheap liveness check.
    async fn test_connection(&self) -> Result<(), StoreError>;

    /// Release connections.
    async fn close(&self);
}

/// Bind representation of a JSON value: `None` for null, strings verbatim,
/// everything else JSON-encoded.
#[must_use]
pub fn bind_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_bind_text() {
        assert_eq!(bind_text(&Value::Null), None);
        assert_eq!(bind_text(&json!("x")).as_deref(), Some("x"));
        assert_eq!(bind_text(&json!(1.5)).as_deref(), Some("1.5"));
        assert_eq!(bind_text(&json!(true)).as_deref(), Some("true"));
        assert_eq!(bind_text(&json!({ "a": 1 })).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_table_schema_helpers() {
        let table = TableSchema {
            schema: "public".into(),
            name: "products".into(),
            columns: vec![ColumnSchema {
                name: "price".into(),
                data_type: "numeric".into(),
                nullable: true,
            }],
        };
        assert_eq!(table.qualified_name(), "public.products");
        assert!(table.column("price").is_some());
        assert!(table.column("title").is_none());
    }
}
