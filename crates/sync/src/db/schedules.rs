//! Recurring job definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use naked_pineapple_core::{MappingId, SyncStatus};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use super::{
    RepositoryError, ScheduleStore, StoredSchedule, decode_json, encode_json, parse_column,
};

/// Internal row type for `sync.schedules`.
#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    mapping_id: i32,
    job_id: String,
    config: Value,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
}

impl TryFrom<ScheduleRow> for StoredSchedule {
    type Error = RepositoryError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            mapping_id: MappingId::new(row.mapping_id),
            job_id: row.job_id,
            config: decode_json(row.config, "schedule config")?,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            last_status: row
                .last_status
                .as_deref()
                .map(|s| parse_column::<SyncStatus>(s, "last_status"))
                .transpose()?,
        })
    }
}

/// [`ScheduleStore`] over `sync.schedules`.
#[derive(Debug, Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    #[instrument(skip(self, schedule), fields(mapping_id = %schedule.mapping_id))]
    async fn upsert(&self, schedule: &StoredSchedule) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO sync.schedules (mapping_id, job_id, config, next_run_at, last_run_at, last_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (mapping_id) DO UPDATE
            SET job_id = EXCLUDED.job_id,
                config = EXCLUDED.config,
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            ",
        )
        .bind(schedule.mapping_id)
        .bind(&schedule.job_id)
        .bind(encode_json(&schedule.config)?)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.last_status.map(|s| s.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(mapping_id = %mapping_id))]
    async fn remove(&self, mapping_id: MappingId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM sync.schedules WHERE mapping_id = $1")
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, mapping_id: MappingId) -> Result<Option<StoredSchedule>, RepositoryError> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            r"
            SELECT mapping_id, job_id, config, next_run_at, last_run_at, last_status
            FROM sync.schedules
            WHERE mapping_id = $1
            ",
        )
        .bind(mapping_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r"
            SELECT mapping_id, job_id, config, next_run_at, last_run_at, last_status
            FROM sync.schedules
            ORDER BY mapping_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_next_run(
        &self,
        mapping_id: MappingId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE sync.schedules SET next_run_at = $2, updated_at = NOW() WHERE mapping_id = $1",
        )
        .bind(mapping_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_run(
        &self,
        mapping_id: MappingId,
        at: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            UPDATE sync.schedules
            SET last_run_at = $2, last_status = $3, updated_at = NOW()
            WHERE mapping_id = $1
            ",
        )
        .bind(mapping_id)
        .bind(at)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
