//! Progress events broadcast while a sync runs.

use naked_pineapple_core::{MappingId, SyncStatus, SyncType};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Fetched records between two progress events.
pub const PROGRESS_INTERVAL: u64 = 100;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Starting,
    Fetching,
    Transforming,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncPhase {
    /// Terminal phase for a finished run.
    #[must_use]
    pub const fn from_status(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Completed | SyncStatus::Skipped => Self::Completed,
            SyncStatus::Cancelled => Self::Cancelled,
            SyncStatus::Failed | SyncStatus::Running => Self::Failed,
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Fetching => write!(f, "fetching"),
            Self::Transforming => write!(f, "transforming"),
            Self::Writing => write!(f, "writing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub mapping_id: MappingId,
    pub run_id: Uuid,
    pub sync_type: SyncType,
    pub phase: SyncPhase,
    pub fetched: u64,
    pub processed: u64,
    pub message: Option<String>,
}

/// Emits events for one run.
#[derive(Debug)]
pub(crate) struct ProgressReporter {
    tx: broadcast::Sender<SyncProgress>,
    mapping_id: MappingId,
    run_id: Uuid,
    sync_type: SyncType,
}

impl ProgressReporter {
    pub(crate) const fn new(
        tx: broadcast::Sender<SyncProgress>,
        mapping_id: MappingId,
        run_id: Uuid,
        sync_type: SyncType,
    ) -> Self {
        Self {
            tx,
            mapping_id,
            run_id,
            sync_type,
        }
    }

    pub(crate) fn emit(
        &self,
        phase: SyncPhase,
        fetched: u64,
        processed: u64,
        message: Option<String>,
    ) {
        // No subscribers is fine.
        let _ = self.tx.send(SyncProgress {
            mapping_id: self.mapping_id,
            run_id: self.run_id,
            sync_type: self.sync_type,
            phase,
            fetched,
            processed,
            message,
        });
    }
}
