//! Integration tests for Naked Pineapple Sync.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p naked-pineapple-integration-tests
//! ```
//!
//! Every scenario runs against the in-memory stores and a scripted Shopify
//! source, so no database or network access is needed.
//!
//! # Test Categories
//!
//! - `full_sync` - Bulk extraction, filtering, coercion, stale deletion
//! - `webhooks` - Signature checks, dedupe, queue processing
//! - `scheduling` - Cron floors, schedule-driven runs, failure streaks
//! - `http` - The JSON API end to end

#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;

use axum::Router;
use naked_pineapple_core::{MappingConfig, MappingId};
use naked_pineapple_sync::hooks::HookRegistry;
use naked_pineapple_sync::memory::{
    MemoryHistoryStore, MemoryIdempotencyStore, MemoryMappingCatalog, MemoryScheduleStore,
    MemoryTargetWriter, MemoryWebhookQueue, ScriptedRecordSource,
};
use naked_pineapple_sync::orchestrator::{
    OrchestratorSettings, SyncOrchestrator, SyncOrchestratorDeps,
};
use naked_pineapple_sync::routes;
use naked_pineapple_sync::scheduler::{Scheduler, SchedulerSettings, SyncJob, SyncWorker};
use naked_pineapple_sync::state::AppState;
use naked_pineapple_sync::webhook::{
    DEFAULT_DEDUPE_TTL, WebhookHeaders, WebhookIngest, WebhookProcessor, WebhookWorkerPool,
    WebhookWorkerSettings, sign,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

pub const WEBHOOK_SECRET: &str = "integration-webhook-secret";
pub const SHOP_DOMAIN: &str = "naked-pineapple.myshopify.com";

/// Products mapping: title, decimal price, active-only, hard deletes.
#[must_use]
pub fn products_mapping(id: i32) -> MappingConfig {
    serde_json::from_value(json!({
        "id": id,
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
        "filters": [{ "field": "status", "operator": "eq", "value": "ACTIVE" }],
        "webhook": { "enabled": true, "delete_strategy": "hard" }
    }))
    .unwrap()
}

/// Product SKUs mapping: reads the first variant through its connection.
#[must_use]
pub fn variant_sku_mapping(id: i32) -> MappingConfig {
    serde_json::from_value(json!({
        "id": id,
        "name": "product skus",
        "source_resource": "Product",
        "target_table": "product_skus",
        "key_mapping": { "source_field": "id", "target_column": "shopify_id" },
        "field_mappings": [
            {
                "source": { "type": "single", "field": "title" },
                "target": { "table": "product_skus", "column": "title" }
            },
            {
                "source": { "type": "single", "field": "variants.edges.0.node.sku" },
                "target": { "table": "product_skus", "column": "sku" }
            }
        ],
        "filters": [{ "field": "status", "operator": "eq", "value": "ACTIVE" }],
        "webhook": { "enabled": true, "delete_strategy": "hard" }
    }))
    .unwrap()
}

/// A product record as a bulk operation or paged query returns it.
#[must_use]
pub fn product(n: u32, status: &str, price: &str) -> Value {
    json!({
        "id": format!("gid://shopify/Product/{n}"),
        "title": format!("Product {n}"),
        "status": status,
        "price": price
    })
}

/// Every component wired over in-memory seams.
pub struct Harness {
    pub catalog: Arc<MemoryMappingCatalog>,
    pub history: Arc<MemoryHistoryStore>,
    pub writer: Arc<MemoryTargetWriter>,
    pub source: Arc<ScriptedRecordSource>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub queue: Arc<MemoryWebhookQueue>,
    pub ingest: Arc<WebhookIngest>,
    pub webhooks: Arc<WebhookWorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub jobs: mpsc::Receiver<SyncJob>,
}

impl Harness {
    /// Harness with mapping 1 (see [`products_mapping`]) installed.
    #[must_use]
    pub fn new(source: ScriptedRecordSource) -> Self {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        catalog.insert(products_mapping(1));
        let history = Arc::new(MemoryHistoryStore::new());
        let writer = Arc::new(MemoryTargetWriter::new());
        let source = Arc::new(source);

        let orchestrator = Arc::new(SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog: catalog.clone(),
            history: history.clone(),
            source: source.clone(),
            writer: writer.clone(),
            hooks: Arc::new(HookRegistry::new()),
            settings: OrchestratorSettings::default(),
        }));

        let queue = Arc::new(MemoryWebhookQueue::new());
        let notify = Arc::new(Notify::new());
        let ingest = Arc::new(WebhookIngest::new(
            SecretString::from(WEBHOOK_SECRET.to_string()),
            Arc::new(MemoryIdempotencyStore::new()),
            queue.clone(),
            notify.clone(),
            DEFAULT_DEDUPE_TTL,
        ));
        let webhooks = Arc::new(WebhookWorkerPool::new(
            queue.clone(),
            history.clone(),
            WebhookProcessor::new(orchestrator.clone()),
            notify,
            WebhookWorkerSettings::default(),
        ));

        let (scheduler, jobs) = Scheduler::new(
            Arc::new(MemoryScheduleStore::new()),
            catalog.clone(),
            SchedulerSettings::default(),
        );

        Self {
            catalog,
            history,
            writer,
            source,
            orchestrator,
            queue,
            ingest,
            webhooks,
            scheduler: Arc::new(scheduler),
            jobs,
        }
    }

    /// Worker that runs scheduled jobs against this harness.
    #[must_use]
    pub fn sync_worker(&self) -> SyncWorker {
        SyncWorker::new(self.orchestrator.clone(), self.scheduler.clone())
    }

    /// The HTTP application over this harness.
    #[must_use]
    pub fn router(&self) -> Router {
        routes::app(AppState::new(
            self.orchestrator.clone(),
            self.scheduler.clone(),
            self.ingest.clone(),
            None,
        ))
    }

    /// Whether mapping `id` has a run in flight.
    #[must_use]
    pub fn is_running(&self, id: i32) -> bool {
        self.orchestrator.is_running(MappingId::new(id))
    }
}

/// Correctly signed headers for `body`.
#[must_use]
pub fn signed_headers(body: &[u8], topic: &str, webhook_id: &str) -> WebhookHeaders {
    WebhookHeaders {
        hmac: Some(sign(body, WEBHOOK_SECRET)),
        topic: Some(topic.to_string()),
        shop_domain: Some(SHOP_DOMAIN.to_string()),
        webhook_id: Some(webhook_id.to_string()),
    }
}
