//! In-process registry of running syncs: at most one per mapping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use naked_pineapple_core::{MappingId, SyncType};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug)]
struct RunningSync {
    run_id: Uuid,
    sync_type: SyncType,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    reason: Option<String>,
}

/// Public view of a running sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSyncInfo {
    pub mapping_id: MappingId,
    pub run_id: Uuid,
    pub sync_type: SyncType,
    pub started_at: DateTime<Utc>,
}

/// Tracks the active run of each mapping.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<MappingId, RunningSync>>,
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MappingId, RunningSync>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `mapping_id` for a new run.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyRunning` if the mapping has an active run.
    pub fn acquire(
        self: &Arc<Self>,
        mapping_id: MappingId,
        sync_type: SyncType,
    ) -> Result<RunGuard, SyncError> {
        let mut runs = self.lock();
        if let Some(existing) = runs.get(&mapping_id) {
            return Err(SyncError::AlreadyRunning {
                mapping_id,
                running: existing.sync_type,
            });
        }

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        runs.insert(
            mapping_id,
            RunningSync {
                run_id,
                sync_type,
                started_at: Utc::now(),
                cancel: cancel.clone(),
                reason: None,
            },
        );

        Ok(RunGuard {
            registry: Arc::clone(self),
            mapping_id,
            run_id,
            cancel,
        })
    }

    /// Signal the mapping's run to stop. Returns whether a run was found.
    pub fn cancel(&self, mapping_id: MappingId, reason: &str) -> bool {
        let mut runs = self.lock();
        let Some(run) = runs.get_mut(&mapping_id) else {
            return false;
        };
        info!(%mapping_id, run_id = %run.run_id, reason, "Cancelling sync");
        run.reason.get_or_insert_with(|| reason.to_string());
        run.cancel.cancel();
        true
    }

    /// Signal every run to stop. Returns how many were signalled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut runs = self.lock();
        for run in runs.values_mut() {
            run.reason.get_or_insert_with(|| reason.to_string());
            run.cancel.cancel();
        }
        runs.len()
    }

    #[must_use]
    pub fn is_running(&self, mapping_id: MappingId) -> bool {
        self.lock().contains_key(&mapping_id)
    }

    /// Type of the mapping's active run.
    #[must_use]
    pub fn running_type(&self, mapping_id: MappingId) -> Option<SyncType> {
        self.lock().get(&mapping_id).map(|r| r.sync_type)
    }

    /// Every active run.
    #[must_use]
    pub fn running(&self) -> Vec<RunningSyncInfo> {
        let mut runs: Vec<RunningSyncInfo> = self
            .lock()
            .iter()
            .map(|(mapping_id, run)| RunningSyncInfo {
                mapping_id: *mapping_id,
                run_id: run.run_id,
                sync_type: run.sync_type,
                started_at: run.started_at,
            })
            .collect();
        runs.sort_by_key(|r| r.mapping_id);
        runs
    }

    fn reason(&self, mapping_id: MappingId, run_id: Uuid) -> Option<String> {
        self.lock()
            .get(&mapping_id)
            .filter(|r| r.run_id == run_id)
            .and_then(|r| r.reason.clone())
    }

    fn release(&self, mapping_id: MappingId, run_id: Uuid) {
        let mut runs = self.lock();
        if runs.get(&mapping_id).is_some_and(|r| r.run_id == run_id) {
            runs.remove(&mapping_id);
        }
    }
}

/// Holds a mapping's registry slot; dropping it frees the mapping.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    mapping_id: MappingId,
    run_id: Uuid,
    cancel: CancellationToken,
}

impl RunGuard {
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reason given to [`RunRegistry::cancel`], if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.registry.reason(self.mapping_id, self.run_id)
    }

    /// `Err(Cancelled)` once the run has been signalled.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Cancelled` with the recorded reason.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled(
                self.cancel_reason()
                    .unwrap_or_else(|| "cancelled".to_string()),
            ));
        }
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(self.mapping_id, self.run_id);
    }
}
