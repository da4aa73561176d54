//! Keyed upserts and deletes against the target store.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::sql::{self, CastColumn};
use super::{StoreError, TableSchema, TargetConnector};
use crate::record::display_value;
use crate::transform::Row;

/// Rows per `INSERT` statement.
pub const UPSERT_CHUNK_SIZE: usize = 500;

const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(300);

/// Counters from one upsert call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    /// Key values written, as text.
    pub keys: Vec<String>,
}

impl UpsertOutcome {
    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
        self.errors.extend(other.errors);
        self.keys.extend(other.keys);
    }
}

/// Write operations the sync engine needs from the target store.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Insert-or-update `rows` by `key_column`.
    ///
    /// Rows without a key value are counted as failed. Statement-level
    /// failures fail only the rows of that statement.
    async fn upsert_rows(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<UpsertOutcome, StoreError>;

    /// Delete rows whose key is not in `keep_keys`. An empty key set deletes
    /// nothing.
    async fn delete_stale(
        &self,
        table: &str,
        key_column: &str,
        keep_keys: &[String],
    ) -> Result<u64, StoreError>;

    /// Delete one row by key.
    async fn delete_by_key(&self, table: &str, key_column: &str, key: &str)
    -> Result<u64, StoreError>;

    /// Stamp `column` with the current time on one row.
    async fn soft_delete_by_key(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        column: &str,
    ) -> Result<u64, StoreError>;

    /// Load up to `limit` `(match, return)` pairs for a lookup transform.
    async fn load_lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        limit: usize,
    ) -> Result<Vec<(Value, Value)>, StoreError>;
}

/// [`TargetWriter`] that generates SQL for a [`TargetConnector`].
#[derive(Clone)]
pub struct SqlWriter {
    connector: Arc<dyn TargetConnector>,
    schemas: Cache<String, Arc<TableSchema>>,
}

impl std::fmt::Debug for SqlWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlWriter").finish_non_exhaustive()
    }
}

impl SqlWriter {
    /// Create a writer. Table schemas are cached for five minutes.
    #[must_use]
    pub fn new(connector: Arc<dyn TargetConnector>) -> Self {
        Self {
            connector,
            schemas: Cache::builder()
                .max_capacity(256)
                .time_to_live(SCHEMA_CACHE_TTL)
                .build(),
        }
    }

    /// The connector this writer uses.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn TargetConnector> {
        &self.connector
    }

    async fn schema(&self, table: &str) -> Result<Arc<TableSchema>, StoreError> {
        if let Some(schema) = self.schemas.get(table).await {
            return Ok(schema);
        }
        let schema = self
            .connector
            .table_schema(table)
            .await?
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let schema = Arc::new(schema);
        self.schemas.insert(table.to_string(), schema.clone()).await;
        Ok(schema)
    }

    async fn upsert_chunk(
        &self,
        table: &str,
        key_column: &str,
        columns: &[CastColumn],
        rows: &[&Row],
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();
        let statement = match sql::upsert(table, key_column, columns, rows.len()) {
            Ok(s) => s,
            Err(e) => {
                outcome.failed = rows.len() as u64;
                outcome.errors.push(e.to_string());
                return outcome;
            }
        };
        let params: Vec<Value> = rows
            .iter()
            .flat_map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null))
            })
            .collect();

        match self.connector.query(&statement, &params).await {
            Ok(returned) => {
                for row in returned {
                    if row.get("inserted").and_then(Value::as_bool) == Some(true) {
                        outcome.inserted += 1;
                    } else {
                        outcome.updated += 1;
                    }
                    if let Some(key) = row.get("key_value").filter(|v| !v.is_null()) {
                        outcome.keys.push(display_value(key));
                    }
                }
            }
            Err(e) => {
                warn!(table, rows = rows.len(), error = %e, "Upsert chunk failed");
                outcome.failed = rows.len() as u64;
                outcome.errors.push(format!("Upsert into {table} failed: {e}"));
            }
        }
        outcome
    }
}

#[async_trait]
impl TargetWriter for SqlWriter {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_rows(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<UpsertOutcome, StoreError> {
        let schema = self.schema(table).await?;
        let mut outcome = UpsertOutcome::default();

        // One row per key, last occurrence wins: a statement may not touch
        // the same row twice.
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<&Row> = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(key) = row.get(key_column).filter(|v| !v.is_null()) else {
                outcome.failed += 1;
                outcome
                    .errors
                    .push(format!("Row is missing key column '{key_column}'"));
                continue;
            };
            match positions.entry(display_value(key)) {
                Entry::Occupied(slot) => {
                    if let Some(existing) = unique.get_mut(*slot.get()) {
                        *existing = row;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(unique.len());
                    unique.push(row);
                }
            }
        }
        let duplicates = rows.len() - unique.len() - usize::try_from(outcome.failed).unwrap_or(0);
        if duplicates > 0 {
            debug!(table, duplicates, "Collapsed rows with repeated keys");
        }

        // Rows are grouped by column set so every statement has one shape.
        let mut groups: BTreeMap<Vec<String>, Vec<&Row>> = BTreeMap::new();
        for row in unique {
            let columns: BTreeSet<&String> = row.keys().collect();
            groups
                .entry(columns.into_iter().cloned().collect())
                .or_default()
                .push(row);
        }

        // Every column is resolved before anything is written.
        let mut statements = Vec::with_capacity(groups.len());
        for (names, group) in groups {
            let columns = names
                .iter()
                .map(|name| {
                    schema
                        .column(name)
                        .map(|c| CastColumn {
                            name: name.clone(),
                            cast: c.data_type.clone(),
                        })
                        .ok_or_else(|| StoreError::UnknownColumn {
                            table: table.to_string(),
                            column: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            statements.push((columns, group));
        }

        for (columns, group) in statements {
            for chunk in group.chunks(UPSERT_CHUNK_SIZE) {
                let chunk_outcome = self
                    .upsert_chunk(table, key_column, &columns, chunk)
                    .await;
                outcome.merge(chunk_outcome);
            }
        }

        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            failed = outcome.failed,
            "Upsert complete"
        );
        Ok(outcome)
    }

    #[instrument(skip(self, keep_keys), fields(keep = keep_keys.len()))]
    async fn delete_stale(
        &self,
        table: &str,
        key_column: &str,
        keep_keys: &[String],
    ) -> Result<u64, StoreError> {
        if keep_keys.is_empty() {
            warn!(table, "Refusing stale delete with an empty key set");
            return Ok(0);
        }
        let statement = sql::delete_stale(table, key_column)?;
        let keys = Value::from(keep_keys.to_vec());
        self.connector.execute(&statement, &[keys]).await
    }

    async fn delete_by_key(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<u64, StoreError> {
        let statement = sql::delete_by_key(table, key_column)?;
        self.connector
            .execute(&statement, &[Value::from(key)])
            .await
    }

    async fn soft_delete_by_key(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        column: &str,
    ) -> Result<u64, StoreError> {
        let statement = sql::soft_delete_by_key(table, key_column, column)?;
        self.connector
            .execute(&statement, &[Value::from(key)])
            .await
    }

    async fn load_lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        limit: usize,
    ) -> Result<Vec<(Value, Value)>, StoreError> {
        let statement = sql::lookup(table, match_column, return_column, limit)?;
        let rows = self.connector.query(&statement, &[]).await?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                (
                    row.remove("match_value").unwrap_or(Value::Null),
                    row.remove("return_value").unwrap_or(Value::Null),
                )
            })
            .collect())
    }
}
