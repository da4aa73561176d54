//! Webhook job queue and dedupe keys.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::{IdempotencyStore, RepositoryError, WebhookJob, WebhookQueue};

/// Jobs left `processing` longer than this are considered abandoned.
const STALLED_AFTER_SECS: i64 = 600;

/// Internal row type for `sync.webhook_jobs`.
#[derive(Debug, sqlx::FromRow)]
struct WebhookJobRow {
    id: Uuid,
    webhook_id: String,
    topic: String,
    shop_domain: String,
    payload: Value,
    received_at: DateTime<Utc>,
    attempts: i32,
}

impl From<WebhookJobRow> for WebhookJob {
    fn from(row: WebhookJobRow) -> Self {
        Self {
            id: row.id,
            webhook_id: row.webhook_id,
            topic: row.topic,
            shop_domain: row.shop_domain,
            payload: row.payload,
            received_at: row.received_at,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
        }
    }
}

/// [`WebhookQueue`] over `sync.webhook_jobs`.
#[derive(Debug, Clone)]
pub struct PgWebhookQueue {
    pool: PgPool,
}

impl PgWebhookQueue {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookQueue for PgWebhookQueue {
    #[instrument(skip(self, job), fields(topic = %job.topic, webhook_id = %job.webhook_id))]
    async fn push(&self, job: &WebhookJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO sync.webhook_jobs (id, webhook_id, topic, shop_domain, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(job.id)
        .bind(&job.webhook_id)
        .bind(&job.topic)
        .bind(&job.shop_domain)
        .bind(&job.payload)
        .bind(job.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(&self, limit: usize) -> Result<Vec<WebhookJob>, RepositoryError> {
        let rows = sqlx::query_as::<_, WebhookJobRow>(
            r"
            UPDATE sync.webhook_jobs
            SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM sync.webhook_jobs
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'processing' AND updated_at < NOW() - make_interval(secs => $2))
                ORDER BY received_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, webhook_id, topic, shop_domain, payload, received_at, attempts
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(STALLED_AFTER_SECS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE sync.webhook_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            UPDATE sync.webhook_jobs
            SET status = CASE WHEN $3::timestamptz IS NULL THEN 'failed' ELSE 'pending' END,
                available_at = COALESCE($3, available_at),
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// [`IdempotencyStore`] over `sync.webhook_dedupe`.
#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, RepositoryError> {
        // An expired key is taken over; a live one leaves the row untouched.
        let result = sqlx::query(
            r"
            INSERT INTO sync.webhook_dedupe (key, expires_at)
            VALUES ($1, NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE sync.webhook_dedupe.expires_at <= NOW()
            ",
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
