//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::orchestrator::SyncOrchestrator;
use crate::scheduler::Scheduler;
use crate::webhook::WebhookIngest;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Arc<Scheduler>,
    ingest: Arc<WebhookIngest>,
    pool: Option<PgPool>,
}

impl AppState {
    #[must_use]
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        scheduler: Arc<Scheduler>,
        ingest: Arc<WebhookIngest>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                scheduler,
                ingest,
                pool,
            }),
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.inner.orchestrator
    }

    /// Owned handle for work that outlives the request.
    #[must_use]
    pub fn orchestrator_handle(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.inner.orchestrator)
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn ingest(&self) -> &WebhookIngest {
        &self.inner.ingest
    }

    /// Service database pool; `None` when running on in-memory stores.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.inner.pool.as_ref()
    }
}
