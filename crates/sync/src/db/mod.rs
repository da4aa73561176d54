//! Persistence for the sync service's own state.
//!
//! # Database: schema `sync`
//!
//! ## Tables
//!
//! - `mappings` - Mapping configuration documents (JSONB)
//! - `sync_history` - One row per sync run
//! - `webhook_history` - One row per processed webhook
//! - `webhook_jobs` - Durable webhook work queue
//! - `webhook_dedupe` - Webhook ids seen within the dedupe window
//! - `schedules` - Recurring job definitions
//!
//! # Migrations
//!
//! Migrations are stored in `crates/sync/migrations/` and run via:
//! ```bash
//! cargo run -p naked-pineapple-cli -- migrate
//! ```
//!
//! Every store is a trait so the orchestrator, webhook pipeline and
//! scheduler can run against [`crate::memory`] in tests.

pub mod history;
pub mod mappings;
pub mod schedules;
pub mod webhooks;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use naked_pineapple_core::{
    MappingConfig, MappingId, ResourceType, ScheduleConfig, SyncHistoryEntry, SyncStatus,
    WebhookHistoryEntry,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use uuid::Uuid;

pub use history::PgHistoryStore;
pub use mappings::PgMappingCatalog;
pub use schedules::PgScheduleStore;
pub use webhooks::{PgIdempotencyStore, PgWebhookQueue};

/// Message recorded on runs swept by [`HistoryStore::fail_stale_runs`].
pub const STALE_RUN_MESSAGE: &str = "Sync interrupted by service restart";

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    Conflict(String),
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Read access to mapping configurations.
#[async_trait]
pub trait MappingCatalog: Send + Sync {
    /// One mapping by id.
    async fn get(&self, id: MappingId) -> Result<Option<MappingConfig>, RepositoryError>;

    /// Enabled mappings fed by `resource`.
    async fn list_enabled_for_resource(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<MappingConfig>, RepositoryError>;

    /// Every mapping.
    async fn list_all(&self) -> Result<Vec<MappingConfig>, RepositoryError>;
}

/// Sync and webhook audit records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a new `running` entry.
    async fn create_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError>;

    /// Persist the final state of an entry.
    async fn complete_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError>;

    /// Most recent runs for a mapping, newest first.
    async fn list_runs(
        &self,
        mapping_id: MappingId,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>, RepositoryError>;

    /// Mark every `running` entry as failed with [`STALE_RUN_MESSAGE`].
    async fn fail_stale_runs(&self) -> Result<u64, RepositoryError>;

    /// Delete the oldest runs beyond `keep`.
    async fn prune(&self, keep: u64) -> Result<u64, RepositoryError>;

    /// Insert a webhook outcome.
    async fn record_webhook(&self, entry: &WebhookHistoryEntry) -> Result<(), RepositoryError>;

    /// Delete the oldest webhook entries beyond `keep`.
    async fn prune_webhooks(&self, keep: u64) -> Result<u64, RepositoryError>;
}

/// A recurring job definition with its runtime bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSchedule {
    pub mapping_id: MappingId,
    pub job_id: String,
    pub config: ScheduleConfig,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
}

/// Recurring job definitions.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the definition for `schedule.mapping_id`.
    async fn upsert(&self, schedule: &StoredSchedule) -> Result<(), RepositoryError>;

    /// Remove a definition. Returns whether one existed.
    async fn remove(&self, mapping_id: MappingId) -> Result<bool, RepositoryError>;

    async fn get(&self, mapping_id: MappingId) -> Result<Option<StoredSchedule>, RepositoryError>;

    async fn list(&self) -> Result<Vec<StoredSchedule>, RepositoryError>;

    /// Store the next due time.
    async fn set_next_run(
        &self,
        mapping_id: MappingId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;

    /// Store the outcome of the latest run.
    async fn record_run(
        &self,
        mapping_id: MappingId,
        at: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), RepositoryError>;
}

/// One queued inbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub id: Uuid,
    /// `X-Shopify-Webhook-Id`, the dedupe key.
    pub webhook_id: String,
    pub topic: String,
    pub shop_domain: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    /// Processing attempts so far, including the current one once claimed.
    pub attempts: u32,
}

impl WebhookJob {
    /// A fresh job received now.
    #[must_use]
    pub fn new(webhook_id: &str, topic: &str, shop_domain: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id: webhook_id.to_string(),
            topic: topic.to_string(),
            shop_domain: shop_domain.to_string(),
            payload,
            received_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Durable queue of webhook jobs.
#[async_trait]
pub trait WebhookQueue: Send + Sync {
    async fn push(&self, job: &WebhookJob) -> Result<(), RepositoryError>;

    /// Take up to `limit` due jobs, incrementing their attempt count.
    async fn claim(&self, limit: usize) -> Result<Vec<WebhookJob>, RepositoryError>;

    async fn complete(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Record a failure. `retry_at` requeues the job; `None` parks it.
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;
}

/// Atomic set-if-absent with expiry.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim `key` for `ttl`. Returns `false` if it is already held.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, RepositoryError>;
}

pub(crate) fn parse_column<T>(value: &str, column: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| RepositoryError::DataCorruption(format!("invalid {column}: {e}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    value: Value,
    column: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(value)
        .map_err(|e| RepositoryError::DataCorruption(format!("invalid {column}: {e}")))
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Value, RepositoryError> {
    serde_json::to_value(value)
        .map_err(|e| RepositoryError::DataCorruption(format!("unserializable value: {e}")))
}

pub(crate) fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
