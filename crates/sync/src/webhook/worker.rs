//! Bounded, rate-limited consumer of the webhook queue.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use naked_pineapple_core::{WebhookHistoryEntry, WebhookStatus};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::processor::{WebhookOutcome, WebhookProcessor};
use crate::db::{HistoryStore, WebhookJob, WebhookQueue};

/// Worker pool tunables.
#[derive(Debug, Clone, Copy)]
pub struct WebhookWorkerSettings {
    /// Jobs processed at once.
    pub concurrency: usize,
    /// Jobs started per second.
    pub rate_per_second: u32,
    /// Attempts before a job is parked as failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_backoff: Duration,
    /// Webhook history entries kept after pruning.
    pub history_retention: u64,
    /// Queue poll interval when idle and not notified.
    pub poll_interval: Duration,
}

impl Default for WebhookWorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_per_second: 10,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            history_retention: 1000,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WebhookWorkerSettings {
    /// Backoff after the given (1-based) failed attempt: 1 s, 2 s, 4 s, ...
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Pulls jobs off the queue and runs them through the processor.
pub struct WebhookWorkerPool {
    queue: Arc<dyn WebhookQueue>,
    history: Arc<dyn HistoryStore>,
    processor: WebhookProcessor,
    limiter: DefaultDirectRateLimiter,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
    settings: WebhookWorkerSettings,
}

impl std::fmt::Debug for WebhookWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookWorkerPool")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl WebhookWorkerPool {
    #[must_use]
    pub fn new(
        queue: Arc<dyn WebhookQueue>,
        history: Arc<dyn HistoryStore>,
        processor: WebhookProcessor,
        notify: Arc<Notify>,
        settings: WebhookWorkerSettings,
    ) -> Self {
        let rate = NonZeroU32::new(settings.rate_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            queue,
            history,
            processor,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            semaphore: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            notify,
            settings,
        }
    }

    /// Consume the queue until `cancel` fires, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            concurrency = self.settings.concurrency,
            rate_per_second = self.settings.rate_per_second,
            "Webhook worker pool started"
        );
        let mut tasks = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            let available = self.semaphore.available_permits();
            let jobs = if available == 0 {
                Vec::new()
            } else {
                match self.queue.claim(available).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(error = %e, "Failed to claim webhook jobs");
                        Vec::new()
                    }
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.notify.notified() => {}
                    () = tokio::time::sleep(self.settings.poll_interval) => {}
                    Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                }
                continue;
            }

            for job in jobs {
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let pool = Arc::clone(&self);
                tasks.spawn(async move {
                    let _permit = permit;
                    pool.handle(job).await;
                });
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Webhook worker pool stopped");
    }

    /// Process every due job, concurrency-wide batches at a time, until the
    /// queue has nothing claimable. Returns the number of jobs handled.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            let jobs = match self.queue.claim(self.settings.concurrency.max(1)).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "Failed to claim webhook jobs");
                    break;
                }
            };
            if jobs.is_empty() {
                break;
            }
            handled += jobs.len();
            futures::future::join_all(jobs.into_iter().map(|job| self.handle(job))).await;
        }
        handled
    }

    async fn handle(&self, job: WebhookJob) {
        self.limiter.until_ready().await;
        let started = Instant::now();

        let failure = match self.processor.process(&job).await {
            Ok(outcome) if outcome.status != WebhookStatus::Failed => {
                if let Err(e) = self.queue.complete(job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to complete webhook job");
                }
                self.record(&job, &outcome, None, started).await;
                return;
            }
            Ok(outcome) => (outcome.errors.join("; "), Some(outcome)),
            Err(e) => (e.to_string(), None),
        };
        let (message, outcome) = failure;

        if job.attempts < self.settings.max_attempts {
            let delay = self.settings.backoff(job.attempts);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                job_id = %job.id,
                topic = %job.topic,
                attempt = job.attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %message,
                "Webhook job failed, retrying"
            );
            if let Err(e) = self.queue.fail(job.id, &message, Some(retry_at)).await {
                error!(job_id = %job.id, error = %e, "Failed to requeue webhook job");
            }
            return;
        }

        error!(
            job_id = %job.id,
            topic = %job.topic,
            attempts = job.attempts,
            error = %message,
            "Webhook job failed permanently"
        );
        if let Err(e) = self.queue.fail(job.id, &message, None).await {
            error!(job_id = %job.id, error = %e, "Failed to park webhook job");
        }
        let outcome = outcome.unwrap_or_else(|| WebhookOutcome {
            status: WebhookStatus::Failed,
            mappings_processed: Vec::new(),
            mappings_skipped: Vec::new(),
            records_written: 0,
            errors: vec![message.clone()],
        });
        self.record(&job, &outcome, Some(message), started).await;
    }

    async fn record(
        &self,
        job: &WebhookJob,
        outcome: &WebhookOutcome,
        error: Option<String>,
        started: Instant,
    ) {
        let entry = WebhookHistoryEntry {
            webhook_id: job.webhook_id.clone(),
            topic: job.topic.clone(),
            shop_domain: job.shop_domain.clone(),
            status: if error.is_some() {
                WebhookStatus::Failed
            } else {
                outcome.status
            },
            mappings_processed: outcome.mappings_processed.clone(),
            records_written: outcome.records_written,
            error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            received_at: job.received_at,
            processed_at: Utc::now(),
        };
        if let Err(e) = self.history.record_webhook(&entry).await {
            error!(webhook_id = %job.webhook_id, error = %e, "Failed to record webhook history");
        }
        if let Err(e) = self
            .history
            .prune_webhooks(self.settings.history_retention)
            .await
        {
            warn!(error = %e, "Failed to prune webhook history");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::{JobState, MemoryHistoryStore, MemoryWebhookQueue, ScriptedRecordSource};
    use crate::webhook::processor::tests::{fixture, mapping};

    struct Harness {
        pool: WebhookWorkerPool,
        queue: Arc<MemoryWebhookQueue>,
        history: Arc<MemoryHistoryStore>,
    }

    /// Pool over a single mapping whose target table rejects every write.
    fn failing_pool(base_backoff: Duration) -> Harness {
        let f = fixture(
            vec![mapping(
                1,
                "products",
                json!({ "enabled": true, "delete_strategy": "hard" }),
            )],
            ScriptedRecordSource::default(),
        );
        f.writer.reject_table("products");
        let queue = Arc::new(MemoryWebhookQueue::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let pool = WebhookWorkerPool::new(
            queue.clone(),
            history.clone(),
            f.processor,
            Arc::new(Notify::new()),
            WebhookWorkerSettings {
                base_backoff,
                rate_per_second: 100,
                ..WebhookWorkerSettings::default()
            },
        );
        Harness {
            pool,
            queue,
            history,
        }
    }

    fn job() -> WebhookJob {
        WebhookJob::new(
            "w-1",
            "products/update",
            "naked-pineapple.myshopify.com",
            json!({ "id": 1, "title": "Pineapple" }),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = WebhookWorkerSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(2), Duration::from_secs(2));
        assert_eq!(settings.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_failed_job_is_requeued_with_backoff() {
        let h = failing_pool(Duration::from_secs(60));
        let job = job();
        h.queue.push(&job).await.unwrap();

        assert_eq!(h.pool.drain().await, 1);
        let (state, error) = h.queue.state(job.id).unwrap();
        assert_eq!(state, JobState::Pending);
        assert!(error.unwrap().starts_with("Mapping 1:"));
        // Retry is not due yet.
        assert_eq!(h.pool.drain().await, 0);
        assert!(h.history.webhooks().is_empty());
    }

    #[tokio::test]
    async fn test_job_parked_after_max_attempts() {
        let h = failing_pool(Duration::ZERO);
        let job = job();
        h.queue.push(&job).await.unwrap();

        assert_eq!(h.pool.drain().await, 3);
        let (state, error) = h.queue.state(job.id).unwrap();
        assert_eq!(state, JobState::Failed);
        assert!(error.is_some());
        assert_eq!(h.queue.count(JobState::Pending), 0);

        let history = h.history.webhooks();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, WebhookStatus::Failed);
        assert_eq!(history[0].webhook_id, "w-1");
        assert!(history[0].error.as_deref().unwrap().contains("Mapping 1:"));
    }
}
