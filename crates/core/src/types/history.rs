//! Audit records for sync runs and webhook jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::MappingId;
use super::status::{SyncStatus, SyncType, WebhookStatus};

/// Maximum number of error messages kept on a history entry.
pub const MAX_HISTORY_ERRORS: usize = 50;

/// Record counters for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// Records pulled from Shopify.
    pub fetched: u64,
    /// Records that passed the mapping filters.
    pub filtered: u64,
    /// Records rejected by the filters.
    pub skipped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Records that failed to transform or write.
    pub failed: u64,
}

/// Time spent in each phase, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncDurations {
    pub fetch_ms: u64,
    pub filter_ms: u64,
    pub transform_ms: u64,
    pub write_ms: u64,
    pub total_ms: u64,
}

/// Persisted audit record of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub id: Uuid,
    pub mapping_id: MappingId,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub stats: SyncStats,
    pub durations: SyncDurations,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncHistoryEntry {
    /// A fresh `running` entry.
    #[must_use]
    pub fn start(mapping_id: MappingId, sync_type: SyncType) -> Self {
        Self {
            id: Uuid::new_v4(),
            mapping_id,
            sync_type,
            status: SyncStatus::Running,
            stats: SyncStats::default(),
            durations: SyncDurations::default(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Truncate an error list to [`MAX_HISTORY_ERRORS`] entries.
pub fn truncate_errors(errors: &mut Vec<String>) {
    errors.truncate(MAX_HISTORY_ERRORS);
}

/// Persisted outcome of one inbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookHistoryEntry {
    pub webhook_id: String,
    pub topic: String,
    pub shop_domain: String,
    pub status: WebhookStatus,
    pub mappings_processed: Vec<MappingId>,
    pub records_written: u64,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}
