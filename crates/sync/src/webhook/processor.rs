//! Applies one queued webhook to every mapping it affects.

use std::sync::Arc;

use naked_pineapple_core::{DeleteStrategy, MappingConfig, MappingId, SyncType, WebhookStatus};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::WebhookError;
use super::payload::{is_delete_topic, normalize_payload, resource_for_topic};
use crate::db::WebhookJob;
use crate::filter::CompiledFilters;
use crate::orchestrator::SyncOrchestrator;
use crate::record::{display_value, resolve_present};
use crate::transform::{TransformOptions, TransformStatus};

/// What processing one webhook did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    pub status: WebhookStatus,
    /// Mappings the webhook was applied to.
    pub mappings_processed: Vec<MappingId>,
    /// Mappings passed over because a full sync was running.
    pub mappings_skipped: Vec<MappingId>,
    /// Rows upserted or deleted.
    pub records_written: u64,
    pub errors: Vec<String>,
}

impl WebhookOutcome {
    fn skipped() -> Self {
        Self {
            status: WebhookStatus::Skipped,
            mappings_processed: Vec::new(),
            mappings_skipped: Vec::new(),
            records_written: 0,
            errors: Vec::new(),
        }
    }
}

/// Routes webhook payloads through the transform engine and writer.
#[derive(Debug, Clone)]
pub struct WebhookProcessor {
    orchestrator: Arc<SyncOrchestrator>,
}

impl WebhookProcessor {
    #[must_use]
    pub const fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Apply `job` to every enabled mapping of its resource.
    ///
    /// Unknown topics are skipped. Per-mapping failures are collected; the
    /// outcome is `Failed` only when every attempted mapping failed.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Repository` if mappings cannot be listed.
    #[instrument(skip(self, job), fields(topic = %job.topic, webhook_id = %job.webhook_id))]
    pub async fn process(&self, job: &WebhookJob) -> Result<WebhookOutcome, WebhookError> {
        let Some(resource) = resource_for_topic(&job.topic) else {
            debug!("Ignoring webhook for unmapped topic");
            return Ok(WebhookOutcome::skipped());
        };

        let mappings: Vec<MappingConfig> = self
            .orchestrator
            .catalog()
            .list_enabled_for_resource(resource)
            .await?
            .into_iter()
            .filter(|m| m.accepts_topic(&job.topic))
            .collect();
        if mappings.is_empty() {
            debug!(%resource, "No mappings accept this webhook");
            return Ok(WebhookOutcome::skipped());
        }

        let record = normalize_payload(job.payload.clone(), resource);
        let delete = is_delete_topic(&job.topic);
        let mut outcome = WebhookOutcome::skipped();
        let mut attempted = 0usize;

        for mapping in &mappings {
            if self.orchestrator.running_type(mapping.id) == Some(SyncType::Full) {
                info!(mapping_id = %mapping.id, "Full sync running, skipping webhook");
                outcome.mappings_skipped.push(mapping.id);
                continue;
            }
            attempted += 1;

            let applied = if delete {
                self.apply_delete(mapping, &record).await
            } else {
                self.apply_upsert(mapping, &record).await
            };
            match applied {
                Ok(written) => {
                    outcome.mappings_processed.push(mapping.id);
                    outcome.records_written += written;
                }
                Err(e) => {
                    warn!(mapping_id = %mapping.id, error = %e, "Webhook failed for mapping");
                    outcome.errors.push(format!("Mapping {}: {e}", mapping.id));
                }
            }
        }

        outcome.status = if attempted == 0 {
            WebhookStatus::Skipped
        } else if outcome.errors.len() == attempted {
            WebhookStatus::Failed
        } else {
            WebhookStatus::Completed
        };
        Ok(outcome)
    }

    async fn apply_delete(
        &self,
        mapping: &MappingConfig,
        record: &Value,
    ) -> Result<u64, WebhookError> {
        let settings = &mapping.webhook;
        if settings.delete_strategy == DeleteStrategy::Ignore {
            return Ok(0);
        }
        let key_mapping = mapping
            .key_mapping
            .as_ref()
            .ok_or_else(|| WebhookError::Mapping("no key mapping configured".to_string()))?;
        let key = resolve_present(record, &key_mapping.source_field)
            .map(display_value)
            .ok_or_else(|| {
                WebhookError::InvalidPayload(format!(
                    "missing key field '{}'",
                    key_mapping.source_field
                ))
            })?;
        let writer = self.orchestrator.writer();

        let deleted = match settings.delete_strategy {
            DeleteStrategy::Hard => {
                writer
                    .delete_by_key(&mapping.target_table, &key_mapping.target_column, &key)
                    .await?
            }
            DeleteStrategy::Soft => {
                let column = settings.soft_delete_column.as_deref().ok_or_else(|| {
                    WebhookError::Mapping("soft delete requires soft_delete_column".to_string())
                })?;
                writer
                    .soft_delete_by_key(
                        &mapping.target_table,
                        &key_mapping.target_column,
                        &key,
                        column,
                    )
                    .await?
            }
            DeleteStrategy::Ignore => 0,
        };
        debug!(
            mapping_id = %mapping.id,
            %key,
            deleted,
            strategy = %settings.delete_strategy,
            "Webhook delete applied"
        );
        Ok(deleted)
    }

    async fn apply_upsert(
        &self,
        mapping: &MappingConfig,
        record: &Value,
    ) -> Result<u64, WebhookError> {
        let filters = CompiledFilters::compile(&mapping.filters)?;
        if !filters.matches(record) {
            debug!(mapping_id = %mapping.id, "Webhook record rejected by filters");
            return Ok(0);
        }
        let key_mapping = mapping
            .key_mapping
            .as_ref()
            .ok_or_else(|| WebhookError::Mapping("no key mapping configured".to_string()))?;

        let prepared = self
            .orchestrator
            .transform_engine()
            .prepare(mapping, TransformOptions::default())
            .await?;
        let result = prepared.transform_record(record);
        drop(prepared);

        if result.status() == TransformStatus::Error {
            let messages: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
            return Err(WebhookError::Mapping(format!(
                "transform failed: {}",
                messages.join("; ")
            )));
        }

        let outcome = self
            .orchestrator
            .writer()
            .upsert_rows(
                &mapping.target_table,
                &key_mapping.target_column,
                std::slice::from_ref(&result.row),
            )
            .await?;
        if outcome.failed > 0 {
            return Err(WebhookError::Mapping(outcome.errors.join("; ")));
        }
        Ok(outcome.inserted + outcome.updated)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::hooks::HookRegistry;
    use crate::memory::{
        MemoryHistoryStore, MemoryMappingCatalog, MemoryTargetWriter, ScriptedRecordSource,
    };
    use crate::orchestrator::{
        FullSyncOptions, IncrementalSyncOptions, OrchestratorSettings, SyncOrchestratorDeps,
    };

    pub(crate) struct Fixture {
        pub orchestrator: Arc<SyncOrchestrator>,
        pub writer: Arc<MemoryTargetWriter>,
        pub processor: WebhookProcessor,
    }

    /// Product mapping writing `title` to `table`, with the given webhook settings.
    pub(crate) fn mapping(id: i32, table: &str, webhook: Value) -> MappingConfig {
        serde_json::from_value(json!({
            "id": id,
            "name": table,
            "source_resource": "Product",
            "target_table": table,
            "key_mapping": { "source_field": "id", "target_column": "shopify_id" },
            "field_mappings": [{
                "source": { "type": "single", "field": "title" },
                "target": { "table": table, "column": "title" }
            }],
            "webhook": webhook
        }))
        .unwrap()
    }

    pub(crate) fn fixture(mappings: Vec<MappingConfig>, source: ScriptedRecordSource) -> Fixture {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        for m in mappings {
            catalog.insert(m);
        }
        let writer = Arc::new(MemoryTargetWriter::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog,
            history: Arc::new(MemoryHistoryStore::new()),
            source: Arc::new(source),
            writer: writer.clone(),
            hooks: Arc::new(HookRegistry::new()),
            settings: OrchestratorSettings::default(),
        }));
        Fixture {
            processor: WebhookProcessor::new(orchestrator.clone()),
            orchestrator,
            writer,
        }
    }

    fn update(n: u32) -> WebhookJob {
        WebhookJob::new(
            &format!("w-{n}"),
            "products/update",
            "naked-pineapple.myshopify.com",
            json!({
                "id": n,
                "admin_graphql_api_id": format!("gid://shopify/Product/{n}"),
                "title": "Pineapple"
            }),
        )
    }

    fn delete(n: u32) -> WebhookJob {
        WebhookJob::new(
            &format!("d-{n}"),
            "products/delete",
            "naked-pineapple.myshopify.com",
            json!({ "id": n }),
        )
    }

    fn seed(f: &Fixture, table: &str, n: u32) {
        f.writer.insert_row(
            table,
            "shopify_id",
            json!({ "shopify_id": format!("gid://shopify/Product/{n}"), "title": "Seeded" }),
        );
    }

    #[tokio::test]
    async fn test_soft_delete_stamps_column() {
        let f = fixture(
            vec![mapping(
                1,
                "products",
                json!({
                    "enabled": true,
                    "delete_strategy": "soft",
                    "soft_delete_column": "deleted_at"
                }),
            )],
            ScriptedRecordSource::default(),
        );
        seed(&f, "products", 7);

        let outcome = f.processor.process(&delete(7)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Completed);
        assert_eq!(outcome.records_written, 1);

        let row = f.writer.row("products", "gid://shopify/Product/7").unwrap();
        assert_eq!(row["title"], json!("Seeded"));
        assert!(row["deleted_at"].is_string());
    }

    #[tokio::test]
    async fn test_soft_delete_without_column_fails() {
        let f = fixture(
            vec![mapping(
                1,
                "products",
                json!({ "enabled": true, "delete_strategy": "soft" }),
            )],
            ScriptedRecordSource::default(),
        );
        seed(&f, "products", 7);

        let outcome = f.processor.process(&delete(7)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Failed);
        assert!(outcome.errors[0].contains("soft_delete_column"));
        assert!(f.writer.row("products", "gid://shopify/Product/7").is_some());
    }

    #[tokio::test]
    async fn test_ignore_strategy_keeps_row() {
        let f = fixture(
            vec![mapping(
                1,
                "products",
                json!({ "enabled": true, "delete_strategy": "ignore" }),
            )],
            ScriptedRecordSource::default(),
        );
        seed(&f, "products", 7);

        let outcome = f.processor.process(&delete(7)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Completed);
        assert_eq!(outcome.mappings_processed, vec![MappingId::new(1)]);
        assert_eq!(outcome.records_written, 0);
        assert!(f.writer.row("products", "gid://shopify/Product/7").is_some());
    }

    #[tokio::test]
    async fn test_failed_only_when_every_mapping_fails() {
        let webhook = json!({ "enabled": true, "delete_strategy": "hard" });
        let f = fixture(
            vec![
                mapping(1, "products", webhook.clone()),
                mapping(2, "broken", webhook),
            ],
            ScriptedRecordSource::default(),
        );
        f.writer.reject_table("broken");

        let outcome = f.processor.process(&update(3)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Completed);
        assert_eq!(outcome.mappings_processed, vec![MappingId::new(1)]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("Mapping 2:"));

        f.writer.reject_table("products");
        let outcome = f.processor.process(&update(4)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Failed);
        assert!(outcome.mappings_processed.is_empty());
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_mapping_skipped_only_during_full_sync() {
        let gate = Arc::new(Notify::new());
        let webhook = json!({ "enabled": true, "delete_strategy": "hard" });
        let f = fixture(
            vec![mapping(1, "products", webhook)],
            ScriptedRecordSource::new(Vec::new()).with_gate(gate.clone()),
        );
        let id = MappingId::new(1);

        let orchestrator = f.orchestrator.clone();
        let incremental = tokio::spawn(async move {
            orchestrator
                .incremental_sync(id, IncrementalSyncOptions::default())
                .await
        });
        while f.orchestrator.running_type(id) != Some(SyncType::Incremental) {
            tokio::task::yield_now().await;
        }
        let outcome = f.processor.process(&update(5)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Completed);
        assert_eq!(outcome.records_written, 1);
        gate.notify_one();
        assert!(incremental.await.unwrap().is_ok());

        let orchestrator = f.orchestrator.clone();
        let full = tokio::spawn(async move {
            orchestrator.full_sync(id, FullSyncOptions::default()).await
        });
        while f.orchestrator.running_type(id) != Some(SyncType::Full) {
            tokio::task::yield_now().await;
        }
        let outcome = f.processor.process(&update(6)).await.unwrap();
        assert_eq!(outcome.status, WebhookStatus::Skipped);
        assert_eq!(outcome.mappings_skipped, vec![id]);
        assert!(f.writer.row("products", "gid://shopify/Product/6").is_none());
        gate.notify_one();
        assert!(full.await.unwrap().is_ok());
    }
}
