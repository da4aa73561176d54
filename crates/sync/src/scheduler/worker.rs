//! Serial consumer of scheduled and manual sync jobs.

use std::sync::Arc;

use chrono::Utc;
use naked_pineapple_core::{SyncStatus, SyncType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::{Scheduler, SyncJob};
use crate::error::SyncError;
use crate::orchestrator::{FullSyncOptions, IncrementalSyncOptions, SyncOrchestrator};

/// Runs one sync job at a time and reports the outcome to the scheduler.
#[derive(Debug, Clone)]
pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Arc<Scheduler>,
}

impl SyncWorker {
    #[must_use]
    pub const fn new(orchestrator: Arc<SyncOrchestrator>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            orchestrator,
            scheduler,
        }
    }

    /// Consume `jobs` until `cancel` fires or the channel closes.
    ///
    /// A job in progress is finished (or cancelled through the orchestrator)
    /// before the loop exits.
    pub async fn run(self, mut jobs: mpsc::Receiver<SyncJob>, cancel: CancellationToken) {
        info!("Sync worker started");
        loop {
            let job = tokio::select! {
                () = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.handle(&job).await;
        }
        info!("Sync worker stopped");
    }

    /// Run one job and feed its status back into the scheduler.
    #[instrument(skip(self, job), fields(mapping_id = %job.mapping_id, job_id = %job.job_id, trigger = ?job.trigger))]
    pub async fn handle(&self, job: &SyncJob) -> SyncStatus {
        let result = match job.sync_type {
            SyncType::Full => {
                self.orchestrator
                    .full_sync(
                        job.mapping_id,
                        FullSyncOptions {
                            delete_stale: job.delete_stale,
                            ..FullSyncOptions::default()
                        },
                    )
                    .await
            }
            SyncType::Incremental => {
                self.orchestrator
                    .incremental_sync(
                        job.mapping_id,
                        IncrementalSyncOptions {
                            lookback_minutes: job.lookback_minutes,
                            ..IncrementalSyncOptions::default()
                        },
                    )
                    .await
            }
            SyncType::Webhook => {
                warn!("Webhook jobs are not run by the sync worker");
                return SyncStatus::Skipped;
            }
        };

        let status = match result {
            Ok(result) => {
                info!(
                    status = %result.status,
                    fetched = result.stats.fetched,
                    inserted = result.stats.inserted,
                    updated = result.stats.updated,
                    failed = result.stats.failed,
                    "Sync job finished"
                );
                result.status
            }
            Err(SyncError::AlreadyRunning { running, .. }) => {
                info!(%running, "Mapping busy, skipping job");
                SyncStatus::Skipped
            }
            Err(e) => {
                error!(error = %e, "Sync job could not start");
                SyncStatus::Failed
            }
        };

        self.scheduler.record_outcome(job, status, Utc::now()).await;
        status
    }
}
