//! HTTP route handlers for the sync service.
//!
//! JSON endpoints consumed by the admin panel, plus the Shopify webhook
//! receiver.
//!
//! # Route Structure
//!
//! ```text
//! GET    /health                           - Liveness check
//! GET    /health/ready                     - Readiness (database reachable)
//!
//! # Webhooks
//! POST   /webhooks/shopify                 - Verify, dedupe and enqueue a webhook
//!
//! # Syncs
//! POST   /mappings/{id}/sync/full          - Start a full (bulk) sync
//! POST   /mappings/{id}/sync/incremental   - Start an incremental sync
//! POST   /mappings/{id}/sync/cancel        - Cancel the running sync
//! GET    /mappings/{id}/history            - Recent runs, newest first
//!
//! # Schedules
//! GET    /mappings/{id}/schedule           - Schedule with upcoming runs
//! PUT    /mappings/{id}/schedule           - Install, update or disable
//! DELETE /mappings/{id}/schedule           - Remove
//! POST   /mappings/{id}/schedule/run       - Enqueue an immediate run
//!
//! # Preview
//! POST   /mappings/{id}/preview            - Filter and transform sample records
//! ```

pub mod health;
pub mod preview;
pub mod schedules;
pub mod syncs;
pub mod webhooks;

use axum::Router;
use tower_http::trace::{DefaultOnResponse, OnResponse, TraceLayer};
use tracing::Span;

use crate::state::AppState;

/// Every route, without state or middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(webhooks::router())
        .merge(syncs::router())
        .merge(schedules::router())
        .merge(preview::router())
}

/// The complete application: routes, request tracing and Sentry layers.
pub fn app(state: AppState) -> Router {
    routes()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        status = tracing::field::Empty,
                        latency_ms = tracing::field::Empty,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &Span| {
                        span.record("status", response.status().as_u16());
                        span.record(
                            "latency_ms",
                            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        );
                        DefaultOnResponse::default().on_response(response, latency, span);
                    },
                ),
        )
        .with_state(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, Response};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use tokio::sync::{Notify, mpsc};
    use tower::ServiceExt;

    use super::*;
    use crate::hooks::HookRegistry;
    use crate::memory::{
        MemoryHistoryStore, MemoryIdempotencyStore, MemoryMappingCatalog, MemoryScheduleStore,
        MemoryTargetWriter, MemoryWebhookQueue, ScriptedRecordSource,
    };
    use crate::orchestrator::{OrchestratorSettings, SyncOrchestrator, SyncOrchestratorDeps};
    use crate::scheduler::{Scheduler, SchedulerSettings, SyncJob};
    use crate::webhook::{DEFAULT_DEDUPE_TTL, WebhookIngest};

    pub const WEBHOOK_SECRET: &str = "route-test-secret";

    pub struct TestApp {
        pub router: Router,
        pub queue: Arc<MemoryWebhookQueue>,
        pub writer: Arc<MemoryTargetWriter>,
        pub jobs: mpsc::Receiver<SyncJob>,
    }

    pub fn test_app(records: Vec<Value>) -> TestApp {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        catalog.insert(
            serde_json::from_value(json!({
                "id": 1,
                "name": "products",
                "source_resource": "Product",
                "target_table": "products",
                "key_mapping": { "source_field": "id", "target_column": "shopify_id" },
                "field_mappings": [
                    {
                        "source": { "type": "single", "field": "title" },
                        "target": { "table": "products", "column": "title" }
                    },
                    {
                        "source": { "type": "single", "field": "price" },
                        "target": { "table": "products", "column": "price" },
                        "transform": { "type": "coerce", "target_type": "decimal" }
                    }
                ],
                "filters": [{ "field": "status", "operator": "eq", "value": "ACTIVE" }]
            }))
            .unwrap(),
        );
        let writer = Arc::new(MemoryTargetWriter::new());
        let queue = Arc::new(MemoryWebhookQueue::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog: catalog.clone(),
            history: Arc::new(MemoryHistoryStore::new()),
            source: Arc::new(ScriptedRecordSource::new(records)),
            writer: writer.clone(),
            hooks: Arc::new(HookRegistry::new()),
            settings: OrchestratorSettings::default(),
        }));
        let (scheduler, jobs) = Scheduler::new(
            Arc::new(MemoryScheduleStore::new()),
            catalog,
            SchedulerSettings::default(),
        );
        let ingest = WebhookIngest::new(
            SecretString::from(WEBHOOK_SECRET.to_string()),
            Arc::new(MemoryIdempotencyStore::new()),
            queue.clone(),
            Arc::new(Notify::new()),
            DEFAULT_DEDUPE_TTL,
        );
        let state = AppState::new(orchestrator, Arc::new(scheduler), Arc::new(ingest), None);

        TestApp {
            router: app(state),
            queue,
            writer,
            jobs,
        }
    }

    pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
        router.clone().oneshot(request).await.unwrap()
    }

    pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    pub async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
