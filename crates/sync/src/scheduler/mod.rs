//! Recurring sync schedules.
//!
//! Each mapping has at most one recurring job (`sync-schedule-<id>`). The
//! [`Scheduler`] owns the definitions and hands due jobs to the
//! [`SyncWorker`] over a bounded channel; the worker runs them one at a time
//! and reports outcomes back so consecutive failures can be tracked.

pub mod cron;
pub mod worker;

pub use self::cron::{CronSchedule, describe};
pub use worker::SyncWorker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use naked_pineapple_core::{MappingId, ScheduleConfig, SchedulerInfo, SyncStatus, SyncType};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{MappingCatalog, RepositoryError, ScheduleStore, StoredSchedule};

/// Capacity of the channel between scheduler and sync worker.
pub const SYNC_JOB_QUEUE_CAPACITY: usize = 64;

/// Errors from schedule management.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Mapping {0} not found")]
    MappingNotFound(MappingId),

    #[error("Invalid cron pattern: {0}")]
    InvalidPattern(String),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error(
        "{sync_type} schedules must be at least {minimum} apart, but '{pattern}' runs every {actual}"
    )]
    IntervalTooShort {
        sync_type: SyncType,
        pattern: String,
        minimum: String,
        actual: String,
    },

    #[error("{0} syncs cannot be scheduled")]
    UnsupportedSyncType(SyncType),

    #[error("Sync job queue is closed")]
    QueueClosed,
}

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    /// The recurring schedule came due.
    Scheduled,
    /// Requested through `run_now`.
    Manual,
    /// Missed while the service was down.
    Recovery,
}

/// One unit of work for the [`SyncWorker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJob {
    pub job_id: String,
    pub mapping_id: MappingId,
    pub sync_type: SyncType,
    pub trigger: JobTrigger,
    pub lookback_minutes: u32,
    pub delete_stale: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncJob {
    fn from_config(
        job_id: String,
        mapping_id: MappingId,
        config: &ScheduleConfig,
        trigger: JobTrigger,
    ) -> Self {
        Self {
            job_id,
            mapping_id,
            sync_type: config.sync_type,
            trigger,
            lookback_minutes: config.lookback(),
            delete_stale: config.delete_stale,
            enqueued_at: Utc::now(),
        }
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// How often due schedules are checked.
    pub tick_interval: Duration,
    /// Consecutive failures that raise an alert.
    pub failure_threshold: u32,
    /// How long a failure streak is remembered without new failures.
    pub failure_ttl: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            failure_threshold: 3,
            failure_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Deterministic recurring job id for a mapping.
#[must_use]
pub fn schedule_job_id(mapping_id: MappingId) -> String {
    format!("sync-schedule-{mapping_id}")
}

/// Owns recurring job definitions and enqueues due runs.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    catalog: Arc<dyn MappingCatalog>,
    jobs: mpsc::Sender<SyncJob>,
    failures: Cache<MappingId, u32>,
    settings: SchedulerSettings,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create the scheduler and the receiving end of its job channel.
    #[must_use]
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn MappingCatalog>,
        settings: SchedulerSettings,
    ) -> (Self, mpsc::Receiver<SyncJob>) {
        let (jobs, receiver) = mpsc::channel(SYNC_JOB_QUEUE_CAPACITY);
        let scheduler = Self {
            store,
            catalog,
            jobs,
            failures: Cache::builder().time_to_live(settings.failure_ttl).build(),
            settings,
        };
        (scheduler, receiver)
    }

    /// Install, update or (when `config.enabled` is false) remove a
    /// mapping's recurring job.
    ///
    /// Returns the resulting schedule view, or `None` after removal.
    ///
    /// # Errors
    ///
    /// - `MappingNotFound` for unknown mappings
    /// - `InvalidPattern`, `InvalidTimezone`, `IntervalTooShort` or
    ///   `UnsupportedSyncType` for schedules that cannot run
    #[instrument(skip(self, config), fields(mapping_id = %mapping_id))]
    pub async fn upsert_schedule(
        &self,
        mapping_id: MappingId,
        config: ScheduleConfig,
    ) -> Result<Option<SchedulerInfo>, SchedulerError> {
        self.ensure_mapping(mapping_id).await?;

        if !config.enabled {
            self.remove_schedule(mapping_id).await?;
            return Ok(None);
        }

        let now = Utc::now();
        let cron = CronSchedule::parse(&config.pattern, &config.timezone)?;
        cron.validate_interval(config.sync_type, now)?;

        let schedule = StoredSchedule {
            mapping_id,
            job_id: schedule_job_id(mapping_id),
            next_run_at: cron.next_after(now),
            config,
            last_run_at: None,
            last_status: None,
        };
        self.store.upsert(&schedule).await?;
        info!(
            pattern = %schedule.config.pattern,
            timezone = %schedule.config.timezone,
            sync_type = %schedule.config.sync_type,
            next_run_at = ?schedule.next_run_at,
            "Schedule installed"
        );

        self.info(mapping_id, 5).await
    }

    /// Remove a mapping's recurring job. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Repository` if the store fails.
    pub async fn remove_schedule(&self, mapping_id: MappingId) -> Result<bool, SchedulerError> {
        let removed = self.store.remove(mapping_id).await?;
        if removed {
            info!(mapping_id = %mapping_id, "Schedule removed");
        }
        Ok(removed)
    }

    /// Enqueue an immediate one-off run, bypassing the schedule.
    ///
    /// Uses the stored schedule's options when one exists; `sync_type`
    /// overrides its type. Returns the job id (`manual-<mapping>-<uuid>`).
    ///
    /// # Errors
    ///
    /// - `MappingNotFound` for unknown mappings
    /// - `UnsupportedSyncType` for webhook runs
    /// - `QueueClosed` if the worker has stopped
    #[instrument(skip(self), fields(mapping_id = %mapping_id))]
    pub async fn run_now(
        &self,
        mapping_id: MappingId,
        sync_type: Option<SyncType>,
    ) -> Result<String, SchedulerError> {
        self.ensure_mapping(mapping_id).await?;

        let mut config = match self.store.get(mapping_id).await? {
            Some(schedule) => schedule.config,
            None => ScheduleConfig {
                enabled: false,
                sync_type: SyncType::Incremental,
                pattern: String::new(),
                timezone: "UTC".to_string(),
                lookback_minutes: None,
                delete_stale: false,
            },
        };
        if let Some(sync_type) = sync_type {
            config.sync_type = sync_type;
        }
        if config.sync_type == SyncType::Webhook {
            return Err(SchedulerError::UnsupportedSyncType(config.sync_type));
        }

        let job_id = format!("manual-{mapping_id}-{}", Uuid::new_v4());
        let job = SyncJob::from_config(job_id.clone(), mapping_id, &config, JobTrigger::Manual);
        self.jobs
            .send(job)
            .await
            .map_err(|_| SchedulerError::QueueClosed)?;
        info!(%job_id, sync_type = %config.sync_type, "Manual sync enqueued");
        Ok(job_id)
    }

    /// Schedule view with the next `upcoming` run times.
    ///
    /// # Errors
    ///
    /// Returns `Repository` if the store fails.
    pub async fn info(
        &self,
        mapping_id: MappingId,
        upcoming: usize,
    ) -> Result<Option<SchedulerInfo>, SchedulerError> {
        let Some(schedule) = self.store.get(mapping_id).await? else {
            return Ok(None);
        };

        let next_runs = match CronSchedule::parse(&schedule.config.pattern, &schedule.config.timezone)
        {
            Ok(cron) if schedule.config.enabled => cron.upcoming(Utc::now(), upcoming),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(mapping_id = %mapping_id, error = %e, "Stored schedule no longer parses");
                Vec::new()
            }
        };
        let consecutive_failures = self.consecutive_failures(mapping_id).await;

        Ok(Some(SchedulerInfo {
            mapping_id,
            job_id: schedule.job_id,
            enabled: schedule.config.enabled,
            sync_type: schedule.config.sync_type,
            description: describe(&schedule.config.pattern),
            pattern: schedule.config.pattern,
            timezone: schedule.config.timezone,
            next_runs,
            last_run_at: schedule.last_run_at,
            last_status: schedule.last_status,
            consecutive_failures,
            alerting: consecutive_failures >= self.settings.failure_threshold,
        }))
    }

    /// Current failure streak for a mapping.
    pub async fn consecutive_failures(&self, mapping_id: MappingId) -> u32 {
        self.failures.get(&mapping_id).await.unwrap_or(0)
    }

    /// Record how a job ended.
    ///
    /// A completed run resets the failure streak; a failed one extends it
    /// and alerts once the threshold is reached. Skipped and cancelled runs
    /// leave the streak alone.
    #[instrument(skip(self, job), fields(mapping_id = %job.mapping_id, job_id = %job.job_id))]
    pub async fn record_outcome(&self, job: &SyncJob, status: SyncStatus, at: DateTime<Utc>) {
        if let Err(e) = self.store.record_run(job.mapping_id, at, status).await {
            error!(error = %e, "Failed to record schedule outcome");
        }

        match status {
            SyncStatus::Completed => self.failures.invalidate(&job.mapping_id).await,
            SyncStatus::Failed => {
                let failures = self.consecutive_failures(job.mapping_id).await + 1;
                self.failures.insert(job.mapping_id, failures).await;

                if failures == self.settings.failure_threshold {
                    error!(
                        consecutive_failures = failures,
                        sync_type = %job.sync_type,
                        "Sync keeps failing"
                    );
                    sentry::capture_message(
                        &format!(
                            "Mapping {} failed {failures} consecutive {} syncs",
                            job.mapping_id, job.sync_type
                        ),
                        sentry::Level::Error,
                    );
                } else {
                    warn!(consecutive_failures = failures, "Sync failed");
                }
            }
            SyncStatus::Running | SyncStatus::Cancelled | SyncStatus::Skipped => {}
        }
    }

    /// Enqueue every schedule whose next run passed while the service was
    /// down. Call once at startup, before [`Self::run`].
    ///
    /// # Errors
    ///
    /// Returns `Repository` if schedules cannot be listed.
    #[instrument(skip(self))]
    pub async fn recover_missed_jobs(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let recovered = self.enqueue_due(now, JobTrigger::Recovery).await?;
        if recovered > 0 {
            info!(count = recovered, "Recovered missed scheduled syncs");
        }
        Ok(recovered)
    }

    /// Enqueue every schedule due at `now`. Returns how many were enqueued.
    ///
    /// # Errors
    ///
    /// Returns `Repository` if schedules cannot be listed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        self.enqueue_due(now, JobTrigger::Scheduled).await
    }

    /// Tick every `tick_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            "Scheduler started"
        );
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn enqueue_due(
        &self,
        now: DateTime<Utc>,
        trigger: JobTrigger,
    ) -> Result<usize, SchedulerError> {
        let mut enqueued = 0;

        for schedule in self.store.list().await? {
            if !schedule.config.enabled {
                continue;
            }
            let cron = match CronSchedule::parse(&schedule.config.pattern, &schedule.config.timezone)
            {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(mapping_id = %schedule.mapping_id, error = %e, "Skipping unparseable schedule");
                    continue;
                }
            };
            let next_run_at = cron.next_after(now);

            match schedule.next_run_at {
                Some(due) if due <= now => {
                    let job = SyncJob::from_config(
                        schedule.job_id.clone(),
                        schedule.mapping_id,
                        &schedule.config,
                        trigger,
                    );
                    match self.jobs.try_send(job) {
                        Ok(()) => {
                            enqueued += 1;
                            debug!(mapping_id = %schedule.mapping_id, ?trigger, "Scheduled sync enqueued");
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(mapping_id = %schedule.mapping_id, "Sync queue full, skipping this occurrence");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return Err(SchedulerError::QueueClosed);
                        }
                    }
                }
                Some(_) => continue,
                None => {}
            }

            self.store
                .set_next_run(schedule.mapping_id, next_run_at)
                .await?;
        }

        Ok(enqueued)
    }

    async fn ensure_mapping(&self, mapping_id: MappingId) -> Result<(), SchedulerError> {
        self.catalog
            .get(mapping_id)
            .await?
            .map(|_| ())
            .ok_or(SchedulerError::MappingNotFound(mapping_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::hooks::tests::mapping;
    use crate::memory::{MemoryMappingCatalog, MemoryScheduleStore};

    struct Harness {
        scheduler: Scheduler,
        jobs: mpsc::Receiver<SyncJob>,
        store: Arc<MemoryScheduleStore>,
    }

    fn harness() -> Harness {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        catalog.insert(mapping(1));
        let store = Arc::new(MemoryScheduleStore::new());
        let (scheduler, jobs) = Scheduler::new(store.clone(), catalog, SchedulerSettings::default());
        Harness {
            scheduler,
            jobs,
            store,
        }
    }

    fn config(sync_type: SyncType, pattern: &str) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            sync_type,
            pattern: pattern.to_string(),
            timezone: "UTC".to_string(),
            lookback_minutes: Some(30),
            delete_stale: false,
        }
    }

    fn job(sync_type: SyncType) -> SyncJob {
        SyncJob::from_config(
            schedule_job_id(MappingId::new(1)),
            MappingId::new(1),
            &config(sync_type, "*/15 * * * *"),
            JobTrigger::Scheduled,
        )
    }

    #[tokio::test]
    async fn test_upsert_installs_deterministic_job() {
        let h = harness();
        let info = h
            .scheduler
            .upsert_schedule(MappingId::new(1), config(SyncType::Incremental, "*/15 * * * *"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(info.job_id, "sync-schedule-1");
        assert_eq!(info.description, "Every 15 minutes");
        assert_eq!(info.next_runs.len(), 5);
        assert!(!info.alerting);
        assert!(h.store.get(MappingId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_rejects_tight_full_schedule() {
        let h = harness();
        let err = h
            .scheduler
            .upsert_schedule(MappingId::new(1), config(SyncType::Full, "0 * * * *"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::IntervalTooShort { .. }));
        assert!(err.to_string().contains("6 hours"), "{err}");
        assert!(h.store.get(MappingId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disable_removes_idempotently() {
        let h = harness();
        let id = MappingId::new(1);
        h.scheduler
            .upsert_schedule(id, config(SyncType::Incremental, "*/15 * * * *"))
            .await
            .unwrap();

        let mut disabled = config(SyncType::Incremental, "*/15 * * * *");
        disabled.enabled = false;
        assert!(h.scheduler.upsert_schedule(id, disabled.clone()).await.unwrap().is_none());
        assert!(h.scheduler.upsert_schedule(id, disabled).await.unwrap().is_none());
        assert!(!h.scheduler.remove_schedule(id).await.unwrap());
        assert!(h.store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_mapping_rejected() {
        let h = harness();
        assert!(matches!(
            h.scheduler
                .upsert_schedule(MappingId::new(9), config(SyncType::Incremental, "*/15 * * * *"))
                .await,
            Err(SchedulerError::MappingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_now_enqueues_manual_job() {
        let mut h = harness();
        let job_id = h
            .scheduler
            .run_now(MappingId::new(1), Some(SyncType::Full))
            .await
            .unwrap();
        assert!(job_id.starts_with("manual-1-"));

        let job = h.jobs.recv().await.unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.trigger, JobTrigger::Manual);
        assert_eq!(job.sync_type, SyncType::Full);
    }

    #[tokio::test]
    async fn test_recover_enqueues_only_overdue_schedules() {
        let mut h = harness();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let overdue = StoredSchedule {
            mapping_id: MappingId::new(1),
            job_id: schedule_job_id(MappingId::new(1)),
            config: config(SyncType::Incremental, "*/15 * * * *"),
            next_run_at: Some(now - chrono::Duration::hours(2)),
            last_run_at: None,
            last_status: None,
        };
        let future = StoredSchedule {
            mapping_id: MappingId::new(2),
            job_id: schedule_job_id(MappingId::new(2)),
            next_run_at: Some(now + chrono::Duration::minutes(10)),
            ..overdue.clone()
        };
        h.store.upsert(&overdue).await.unwrap();
        h.store.upsert(&future).await.unwrap();

        assert_eq!(h.scheduler.recover_missed_jobs(now).await.unwrap(), 1);
        let job = h.jobs.recv().await.unwrap();
        assert_eq!(job.mapping_id, MappingId::new(1));
        assert_eq!(job.trigger, JobTrigger::Recovery);
        assert_eq!(job.lookback_minutes, 30);
        assert!(h.jobs.try_recv().is_err());

        // The missed occurrence is consumed
        let stored = h.store.get(MappingId::new(1)).await.unwrap().unwrap();
        assert_eq!(
            stored.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 16, 12, 15, 0).unwrap())
        );
        assert_eq!(h.scheduler.tick(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_streak_alerts_and_resets() {
        let h = harness();
        let id = MappingId::new(1);
        let job = job(SyncType::Incremental);

        for _ in 0..2 {
            h.scheduler.record_outcome(&job, SyncStatus::Failed, Utc::now()).await;
        }
        h.scheduler.record_outcome(&job, SyncStatus::Skipped, Utc::now()).await;
        assert_eq!(h.scheduler.consecutive_failures(id).await, 2);

        h.scheduler.record_outcome(&job, SyncStatus::Failed, Utc::now()).await;
        assert_eq!(h.scheduler.consecutive_failures(id).await, 3);

        h.scheduler.record_outcome(&job, SyncStatus::Completed, Utc::now()).await;
        assert_eq!(h.scheduler.consecutive_failures(id).await, 0);
    }

    #[tokio::test]
    async fn test_info_reports_alerting() {
        let h = harness();
        let id = MappingId::new(1);
        h.scheduler
            .upsert_schedule(id, config(SyncType::Incremental, "*/15 * * * *"))
            .await
            .unwrap();
        let job = job(SyncType::Incremental);
        for _ in 0..3 {
            h.scheduler.record_outcome(&job, SyncStatus::Failed, Utc::now()).await;
        }

        let info = h.scheduler.info(id, 3).await.unwrap().unwrap();
        assert_eq!(info.consecutive_failures, 3);
        assert!(info.alerting);
        assert_eq!(info.last_status, Some(SyncStatus::Failed));
        assert_eq!(info.next_runs.len(), 3);
    }
}
