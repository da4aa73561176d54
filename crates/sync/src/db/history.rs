//! Sync and webhook history repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use naked_pineapple_core::{MappingId, SyncHistoryEntry, WebhookHistoryEntry};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    HistoryStore, RepositoryError, STALE_RUN_MESSAGE, decode_json, encode_json, parse_column,
    to_i64,
};

/// Internal row type for `sync.sync_history`.
#[derive(Debug, sqlx::FromRow)]
struct SyncHistoryRow {
    id: Uuid,
    mapping_id: i32,
    sync_type: String,
    status: String,
    stats: Value,
    durations: Value,
    errors: Value,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SyncHistoryRow> for SyncHistoryEntry {
    type Error = RepositoryError;

    fn try_from(row: SyncHistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            mapping_id: MappingId::new(row.mapping_id),
            sync_type: parse_column(&row.sync_type, "sync_type")?,
            status: parse_column(&row.status, "status")?,
            stats: decode_json(row.stats, "stats")?,
            durations: decode_json(row.durations, "durations")?,
            errors: decode_json(row.errors, "errors")?,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// [`HistoryStore`] over `sync.sync_history` and `sync.webhook_history`.
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    #[instrument(skip(self, entry), fields(mapping_id = %entry.mapping_id, sync_type = %entry.sync_type))]
    async fn create_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO sync.sync_history
                (id, mapping_id, sync_type, status, stats, durations, errors, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(entry.id)
        .bind(entry.mapping_id)
        .bind(entry.sync_type.to_string())
        .bind(entry.status.to_string())
        .bind(encode_json(&entry.stats)?)
        .bind(encode_json(&entry.durations)?)
        .bind(encode_json(&entry.errors)?)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, entry), fields(mapping_id = %entry.mapping_id, status = %entry.status))]
    async fn complete_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE sync.sync_history
            SET status = $2, stats = $3, durations = $4, errors = $5, completed_at = $6
            WHERE id = $1
            ",
        )
        .bind(entry.id)
        .bind(entry.status.to_string())
        .bind(encode_json(&entry.stats)?)
        .bind(encode_json(&entry.durations)?)
        .bind(encode_json(&entry.errors)?)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        mapping_id: MappingId,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>, RepositoryError> {
        let rows = sqlx::query_as::<_, SyncHistoryRow>(
            r"
            SELECT id, mapping_id, sync_type, status, stats, durations, errors, started_at, completed_at
            FROM sync.sync_history
            WHERE mapping_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            ",
        )
        .bind(mapping_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self))]
    async fn fail_stale_runs(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE sync.sync_history
            SET status = 'failed',
                completed_at = NOW(),
                errors = errors || jsonb_build_array($1::text)
            WHERE status = 'running'
            ",
        )
        .bind(STALE_RUN_MESSAGE)
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!(swept, "Marked interrupted sync runs as failed");
        }
        Ok(swept)
    }

    async fn prune(&self, keep: u64) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM sync.sync_history
            WHERE id IN (
                SELECT id FROM sync.sync_history
                ORDER BY started_at DESC
                OFFSET $1
            )
            ",
        )
        .bind(to_i64(keep))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, entry), fields(topic = %entry.topic))]
    async fn record_webhook(&self, entry: &WebhookHistoryEntry) -> Result<(), RepositoryError> {
        let mappings: Vec<i32> = entry
            .mappings_processed
            .iter()
            .copied()
            .map(MappingId::as_i32)
            .collect();

        sqlx::query(
            r"
            INSERT INTO sync.webhook_history
                (webhook_id, topic, shop_domain, status, mappings_processed, records_written,
                 error, duration_ms, received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&entry.webhook_id)
        .bind(&entry.topic)
        .bind(&entry.shop_domain)
        .bind(entry.status.to_string())
        .bind(mappings)
        .bind(to_i64(entry.records_written))
        .bind(entry.error.as_deref())
        .bind(to_i64(entry.duration_ms))
        .bind(entry.received_at)
        .bind(entry.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_webhooks(&self, keep: u64) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM sync.webhook_history
            WHERE id IN (
                SELECT id FROM sync.webhook_history
                ORDER BY processed_at DESC
                OFFSET $1
            )
            ",
        )
        .bind(to_i64(keep))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use naked_pineapple_core::{SyncStatus, SyncType};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_row_decodes() {
        let row = SyncHistoryRow {
            id: Uuid::new_v4(),
            mapping_id: 2,
            sync_type: "full".into(),
            status: "completed".into(),
            stats: json!({
                "fetched": 3, "filtered": 2, "skipped": 1, "inserted": 2,
                "updated": 0, "deleted": 0, "failed": 0
            }),
            durations: json!({
                "fetch_ms": 1, "filter_ms": 0, "transform_ms": 0, "write_ms": 2, "total_ms": 3
            }),
            errors: json!([]),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        let entry = SyncHistoryEntry::try_from(row).unwrap();
        assert_eq!(entry.sync_type, SyncType::Full);
        assert_eq!(entry.status, SyncStatus::Completed);
        assert_eq!(entry.stats.skipped, 1);
    }

    #[test]
    fn test_bad_status_is_corruption() {
        let row = SyncHistoryRow {
            id: Uuid::new_v4(),
            mapping_id: 2,
            sync_type: "full".into(),
            status: "exploded".into(),
            stats: json!({}),
            durations: json!({}),
            errors: json!([]),
            started_at: Utc::now(),
            completed_at: None,
        };
        assert!(matches!(
            SyncHistoryEntry::try_from(row),
            Err(RepositoryError::DataCorruption(_))
        ));
    }
}
