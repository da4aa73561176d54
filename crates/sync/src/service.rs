//! Composition root.
//!
//! Every component is built here from the configuration and the database
//! pools; nothing is global. Startup runs in a fixed order:
//!
//! 1. Check the target database is reachable
//! 2. Sweep runs left `running` by a previous process
//! 3. Register the built-in hooks
//! 4. Enqueue schedules missed while the service was down
//! 5. Spawn the sync worker, webhook worker pool and scheduler loop

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncServiceConfig;
use crate::db::{
    PgHistoryStore, PgIdempotencyStore, PgMappingCatalog, PgScheduleStore, PgWebhookQueue,
};
use crate::error::SyncError;
use crate::hooks::{DEFAULT_BACKUPS_KEPT, HookRegistry, register_builtin_hooks};
use crate::orchestrator::{SyncOrchestrator, SyncOrchestratorDeps};
use crate::routes;
use crate::scheduler::{Scheduler, SyncJob, SyncWorker};
use crate::shopify::{ShopifyClientPool, ShopifyRecordSource};
use crate::state::AppState;
use crate::store::{PgConnector, SqlWriter, TargetConnector};
use crate::webhook::{WebhookIngest, WebhookProcessor, WebhookWorkerPool};

/// How long shutdown waits for background tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Database pools the service runs on.
#[derive(Debug, Clone)]
pub struct ServicePools {
    /// The service's own `sync` schema.
    pub service: PgPool,
    /// Where mapped rows are written; may be the same database.
    pub target: PgPool,
}

/// Every long-lived component of the sync service.
pub struct SyncService {
    pools: ServicePools,
    connector: Arc<dyn TargetConnector>,
    hooks: Arc<HookRegistry>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Arc<Scheduler>,
    sync_jobs: Option<mpsc::Receiver<SyncJob>>,
    ingest: Arc<WebhookIngest>,
    webhook_pool: Arc<WebhookWorkerPool>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("orchestrator", &self.orchestrator)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Wire up every component. Nothing runs until [`Self::start`].
    pub async fn build(config: &SyncServiceConfig, pools: ServicePools) -> Self {
        let connector: Arc<dyn TargetConnector> = Arc::new(PgConnector::new(pools.target.clone()));
        let writer = Arc::new(SqlWriter::new(connector.clone()));
        let catalog = Arc::new(PgMappingCatalog::new(pools.service.clone()));
        let history = Arc::new(PgHistoryStore::new(pools.service.clone()));
        let hooks = Arc::new(HookRegistry::new());

        let client = ShopifyClientPool::new(config.shopify.access_token.clone())
            .get(&config.shopify.store, &config.shopify.api_version)
            .await;
        let source = Arc::new(ShopifyRecordSource::new(client));

        let orchestrator = Arc::new(SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog: catalog.clone(),
            history: history.clone(),
            source,
            writer,
            hooks: hooks.clone(),
            settings: config.orchestrator_settings(),
        }));

        let (scheduler, sync_jobs) = Scheduler::new(
            Arc::new(PgScheduleStore::new(pools.service.clone())),
            catalog,
            config.scheduler_settings(),
        );

        let queue = Arc::new(PgWebhookQueue::new(pools.service.clone()));
        let notify = Arc::new(Notify::new());
        let ingest = Arc::new(WebhookIngest::new(
            config.shopify.webhook_secret.clone(),
            Arc::new(PgIdempotencyStore::new(pools.service.clone())),
            queue.clone(),
            notify.clone(),
            config.webhook_dedupe_ttl,
        ));
        let webhook_pool = Arc::new(WebhookWorkerPool::new(
            queue,
            history,
            WebhookProcessor::new(orchestrator.clone()),
            notify,
            config.webhook_settings(),
        ));

        Self {
            pools,
            connector,
            hooks,
            orchestrator,
            scheduler: Arc::new(scheduler),
            sync_jobs: Some(sync_jobs),
            ingest,
            webhook_pool,
        }
    }

    /// Check the target, sweep stale runs and register the built-in hooks.
    ///
    /// Enough to run syncs directly through [`Self::orchestrator`]; call
    /// once per process.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Store` if the target database is unreachable and
    /// `SyncError::Repository` if the history store fails.
    pub async fn prepare(&self) -> Result<(), SyncError> {
        self.connector.test_connection().await?;
        self.orchestrator.recover_stale_runs().await?;

        register_builtin_hooks(&self.hooks, &self.connector, DEFAULT_BACKUPS_KEPT);
        info!(hooks = self.hooks.len(), "Built-in hooks registered");
        Ok(())
    }

    /// Run the full startup sequence and spawn the background workers.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Repository` / `SyncError::Scheduler` if the
    /// stale-run sweep or missed-job recovery cannot read the database.
    pub async fn start(&mut self) -> Result<BackgroundTasks, SyncError> {
        self.prepare().await?;

        self.scheduler.recover_missed_jobs(Utc::now()).await?;

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if let Some(jobs) = self.sync_jobs.take() {
            let worker = SyncWorker::new(self.orchestrator.clone(), self.scheduler.clone());
            tasks.spawn(worker.run(jobs, cancel.clone()));
        } else {
            warn!("Sync worker already started");
        }
        tasks.spawn(self.webhook_pool.clone().run(cancel.clone()));
        tasks.spawn(self.scheduler.clone().run(cancel.clone()));

        Ok(BackgroundTasks {
            cancel,
            tasks,
            orchestrator: self.orchestrator.clone(),
            connector: self.connector.clone(),
        })
    }

    /// The HTTP application.
    #[must_use]
    pub fn router(&self) -> Router {
        routes::app(AppState::new(
            self.orchestrator.clone(),
            self.scheduler.clone(),
            self.ingest.clone(),
            Some(self.pools.service.clone()),
        ))
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

/// Handles to the spawned workers.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    orchestrator: Arc<SyncOrchestrator>,
    connector: Arc<dyn TargetConnector>,
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl BackgroundTasks {
    /// Cancel running syncs, stop the workers and wait for them.
    pub async fn shutdown(mut self) {
        let cancelled = self.orchestrator.cancel_all("service shutting down");
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled running syncs");
        }
        self.cancel.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop in time, aborting");
            self.tasks.abort_all();
        }
        self.connector.close().await;
        info!("Background tasks stopped");
    }
}
