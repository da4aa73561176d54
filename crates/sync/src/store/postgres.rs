//! `PostgreSQL` target connector.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::{ColumnSchema, JsonRow, StoreError, TableSchema, TargetConnector, bind_text, sql};

const INTROSPECT_SQL: &str = r"
SELECT n.nspname::text AS table_schema,
       c.relname::text AS table_name,
       a.attname::text AS column_name,
       format_type(a.atttypid, a.atttypmod) AS data_type,
       NOT a.attnotnull AS nullable
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p')
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname NOT LIKE 'pg_toast%'
  AND ($1::text IS NULL OR n.nspname = $1)
  AND ($2::text IS NULL OR c.relname = $2)
ORDER BY n.nspname, c.relname, a.attnum";

/// Connector over a `PgPool`.
///
/// Rows come back through `row_to_json`, so any result shape maps onto
/// [`JsonRow`] without compile-time query types.
#[derive(Debug, Clone)]
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn introspect(
        &self,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> Result<Vec<TableSchema>, StoreError> {
        let rows = sqlx::query(INTROSPECT_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let schema: String = row.try_get("table_schema")?;
            let name: String = row.try_get("table_name")?;
            let column = ColumnSchema {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
            };
            match tables.last_mut() {
                Some(t) if t.schema == schema && t.name == name => t.columns.push(column),
                _ => tables.push(TableSchema {
                    schema,
                    name,
                    columns: vec![column],
                }),
            }
        }
        Ok(tables)
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &[Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = query.bind(bind_text(param));
    }
    query
}

#[async_trait]
impl TargetConnector for PgConnector {
    #[instrument(skip(self, sql, params), fields(params = params.len()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<JsonRow>, StoreError> {
        let wrapped = format!("WITH t AS ({sql}) SELECT row_to_json(t)::text AS row FROM t");
        let rows = bind_all(sqlx::query(&wrapped), params)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let text: String = row.try_get("row")?;
                match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => Ok(map),
                    Ok(other) => Err(StoreError::Decode(format!("expected object, got {other}"))),
                    Err(e) => Err(StoreError::Decode(e.to_string())),
                }
            })
            .collect()
    }

    #[instrument(skip(self, sql, params), fields(params = params.len()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn introspect_schema(&self) -> Result<Vec<TableSchema>, StoreError> {
        self.introspect(None, None).await
    }

    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let (schema, name) = sql::split_table(table);
        Ok(self
            .introspect(Some(schema), Some(name))
            .await?
            .into_iter()
            .next())
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
