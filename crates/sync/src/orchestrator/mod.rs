//! Sync orchestrator: drives full and incremental runs end to end.
//!
//! A run moves through `starting → fetching → transforming → writing` and
//! ends `completed`, `failed` or `cancelled`:
//!
//! 1. Claim the mapping in the [`RunRegistry`] (one run per mapping)
//! 2. Create a `running` history entry, run pre-sync hooks
//! 3. Fetch (bulk for full syncs, paginated for incremental), post-fetch hooks
//! 4. Filter, transform, post-transform hooks
//! 5. Upsert by key, post-write hooks, optional stale-row deletion
//! 6. Finalize history, prune it, emit the final progress event, post-sync hooks
//!
//! Only `MappingNotFound`, `AlreadyRunning` and catalog failures are returned
//! as errors; everything after the registry claim ends in a [`SyncResult`].

pub mod progress;
pub mod registry;

pub use progress::{PROGRESS_INTERVAL, SyncPhase, SyncProgress};
pub use registry::{RunGuard, RunRegistry, RunningSyncInfo};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use naked_pineapple_core::{
    DEFAULT_LOOKBACK_MINUTES, MAX_HISTORY_ERRORS, MappingConfig, MappingId, SyncDurations,
    SyncHistoryEntry, SyncStats, SyncStatus, SyncType,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{HistoryStore, MappingCatalog, RepositoryError};
use crate::error::SyncError;
use crate::filter::CompiledFilters;
use crate::hooks::{HookContext, HookPhase, HookRegistry};
use crate::shopify::{QueryPlan, RecordSource};
use crate::store::TargetWriter;
use crate::transform::{
    DEFAULT_LOOKUP_MAX_ROWS, Row, TransformEngine, TransformOptions, TransformStatus,
};
use progress::{PROGRESS_CHANNEL_CAPACITY, ProgressReporter};

/// Tunables for the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// History entries kept after pruning.
    pub history_retention: u64,
    /// Row cap per lookup table.
    pub lookup_max_rows: usize,
    /// Bulk timeout when a full sync does not set one.
    pub bulk_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_retention: 1000,
            lookup_max_rows: DEFAULT_LOOKUP_MAX_ROWS,
            bulk_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Everything the orchestrator needs, injected by the composition root.
pub struct SyncOrchestratorDeps {
    pub catalog: Arc<dyn MappingCatalog>,
    pub history: Arc<dyn HistoryStore>,
    pub source: Arc<dyn RecordSource>,
    pub writer: Arc<dyn TargetWriter>,
    pub hooks: Arc<HookRegistry>,
    pub settings: OrchestratorSettings,
}

/// Options for [`SyncOrchestrator::full_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullSyncOptions {
    pub dry_run: bool,
    /// Delete target rows whose key was not written by this run.
    pub delete_stale: bool,
    pub bulk_timeout: Option<Duration>,
}

/// Options for [`SyncOrchestrator::incremental_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalSyncOptions {
    pub dry_run: bool,
    /// Explicit `updated_at` floor; overrides the lookback.
    pub since: Option<DateTime<Utc>>,
    pub lookback_minutes: u32,
}

impl Default for IncrementalSyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            since: None,
            lookback_minutes: DEFAULT_LOOKBACK_MINUTES,
        }
    }
}

impl IncrementalSyncOptions {
    fn floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.since
            .unwrap_or_else(|| now - chrono::Duration::minutes(i64::from(self.lookback_minutes)))
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub mapping_id: MappingId,
    pub sync_type: SyncType,
    pub success: bool,
    pub status: SyncStatus,
    pub stats: SyncStats,
    pub durations: SyncDurations,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy)]
enum Fetch {
    Bulk {
        timeout: Duration,
        delete_stale: bool,
    },
    Incremental {
        since: DateTime<Utc>,
    },
}

impl Fetch {
    const fn sync_type(self) -> SyncType {
        match self {
            Self::Bulk { .. } => SyncType::Full,
            Self::Incremental { .. } => SyncType::Incremental,
        }
    }
}

/// Counters and errors accumulated by one run.
#[derive(Debug, Default)]
struct RunState {
    stats: SyncStats,
    durations: SyncDurations,
    errors: Vec<String>,
    processed: u64,
}

impl RunState {
    fn push_error(&mut self, message: String) {
        if self.errors.len() < MAX_HISTORY_ERRORS {
            self.errors.push(message);
        }
    }

    /// The error that ended the run is always kept.
    fn push_fatal(&mut self, message: String) {
        self.errors.truncate(MAX_HISTORY_ERRORS - 1);
        self.errors.push(message);
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs syncs and tracks which mappings are busy.
pub struct SyncOrchestrator {
    catalog: Arc<dyn MappingCatalog>,
    history: Arc<dyn HistoryStore>,
    source: Arc<dyn RecordSource>,
    writer: Arc<dyn TargetWriter>,
    hooks: Arc<HookRegistry>,
    transform: TransformEngine,
    registry: Arc<RunRegistry>,
    progress: broadcast::Sender<SyncProgress>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(deps: SyncOrchestratorDeps) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            transform: TransformEngine::new(deps.writer.clone(), deps.settings.lookup_max_rows),
            catalog: deps.catalog,
            history: deps.history,
            source: deps.source,
            writer: deps.writer,
            hooks: deps.hooks,
            registry: Arc::new(RunRegistry::new()),
            progress,
            settings: deps.settings,
        }
    }

    /// Re-extract every record of the mapping's resource through a bulk
    /// operation.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if the mapping has an active run
    /// - `MappingNotFound` for unknown ids
    /// - `Repository` if the catalog cannot be read
    #[instrument(skip(self), fields(sync_type = "full"))]
    pub async fn full_sync(
        &self,
        mapping_id: MappingId,
        options: FullSyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let guard = self.registry.acquire(mapping_id, SyncType::Full)?;
        let mapping = self.load_mapping(mapping_id).await?;
        let fetch = Fetch::Bulk {
            timeout: options.bulk_timeout.unwrap_or(self.settings.bulk_timeout),
            delete_stale: options.delete_stale,
        };
        Ok(self.execute(&guard, &mapping, fetch, options.dry_run).await)
    }

    /// Fetch records updated since `options.since` (or now minus the
    /// lookback) page by page.
    ///
    /// # Errors
    ///
    /// Same as [`Self::full_sync`].
    #[instrument(skip(self), fields(sync_type = "incremental"))]
    pub async fn incremental_sync(
        &self,
        mapping_id: MappingId,
        options: IncrementalSyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let guard = self.registry.acquire(mapping_id, SyncType::Incremental)?;
        let mapping = self.load_mapping(mapping_id).await?;
        let fetch = Fetch::Incremental {
            since: options.floor(Utc::now()),
        };
        Ok(self.execute(&guard, &mapping, fetch, options.dry_run).await)
    }

    /// Signal the mapping's run to stop. Returns whether one was running.
    pub fn cancel(&self, mapping_id: MappingId, reason: &str) -> bool {
        self.registry.cancel(mapping_id, reason)
    }

    /// Signal every running sync to stop.
    pub fn cancel_all(&self, reason: &str) -> usize {
        self.registry.cancel_all(reason)
    }

    #[must_use]
    pub fn is_running(&self, mapping_id: MappingId) -> bool {
        self.registry.is_running(mapping_id)
    }

    #[must_use]
    pub fn running_type(&self, mapping_id: MappingId) -> Option<SyncType> {
        self.registry.running_type(mapping_id)
    }

    #[must_use]
    pub fn running(&self) -> Vec<RunningSyncInfo> {
        self.registry.running()
    }

    /// Subscribe to progress events of every run.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Sweep runs left `running` by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the history store fails.
    pub async fn recover_stale_runs(&self) -> Result<u64, RepositoryError> {
        let swept = self.history.fail_stale_runs().await?;
        if swept > 0 {
            warn!(count = swept, "Marked interrupted sync runs as failed");
        }
        Ok(swept)
    }

    /// Recent runs of a mapping, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the history store fails.
    pub async fn history(
        &self,
        mapping_id: MappingId,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>, RepositoryError> {
        self.history.list_runs(mapping_id, limit).await
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn MappingCatalog> {
        &self.catalog
    }

    #[must_use]
    pub const fn transform_engine(&self) -> &TransformEngine {
        &self.transform
    }

    #[must_use]
    pub fn writer(&self) -> &Arc<dyn TargetWriter> {
        &self.writer
    }

    async fn load_mapping(&self, mapping_id: MappingId) -> Result<MappingConfig, SyncError> {
        self.catalog
            .get(mapping_id)
            .await?
            .ok_or(SyncError::MappingNotFound(mapping_id))
    }

    async fn execute(
        &self,
        guard: &RunGuard,
        mapping: &MappingConfig,
        fetch: Fetch,
        dry_run: bool,
    ) -> SyncResult {
        let started = Instant::now();
        let sync_type = fetch.sync_type();
        let mut entry = SyncHistoryEntry::start(mapping.id, sync_type);
        entry.id = guard.run_id();
        if let Err(e) = self.history.create_run(&entry).await {
            error!(mapping_id = %mapping.id, error = %e, "Failed to record sync start");
        }

        let progress =
            ProgressReporter::new(self.progress.clone(), mapping.id, guard.run_id(), sync_type);
        progress.emit(SyncPhase::Starting, 0, 0, None);
        info!(mapping_id = %mapping.id, %sync_type, dry_run, "Sync started");

        let mut run = RunState::default();
        let outcome = self
            .run_phases(guard, mapping, fetch, dry_run, &progress, &mut run)
            .await;

        let status = match &outcome {
            Ok(()) => SyncStatus::Completed,
            Err(e) if guard.is_cancelled() || e.is_cancellation() => SyncStatus::Cancelled,
            Err(_) => SyncStatus::Failed,
        };
        if let Err(e) = outcome {
            let message = match (status, guard.cancel_reason()) {
                (SyncStatus::Cancelled, Some(reason)) => SyncError::Cancelled(reason).to_string(),
                _ => e.to_string(),
            };
            run.push_fatal(message);
        }
        run.durations.total_ms = elapsed_ms(started);

        entry.status = status;
        entry.stats = run.stats;
        entry.durations = run.durations;
        entry.errors.clone_from(&run.errors);
        entry.completed_at = Some(Utc::now());
        if let Err(e) = self.history.complete_run(&entry).await {
            error!(mapping_id = %mapping.id, error = %e, "Failed to record sync outcome");
        }
        if let Err(e) = self.history.prune(self.settings.history_retention).await {
            warn!(error = %e, "Failed to prune sync history");
        }

        progress.emit(
            SyncPhase::from_status(status),
            run.stats.fetched,
            run.processed,
            run.errors.last().filter(|_| status != SyncStatus::Completed).cloned(),
        );

        match status {
            SyncStatus::Completed => {
                info!(
                    mapping_id = %mapping.id,
                    %sync_type,
                    fetched = run.stats.fetched,
                    inserted = run.stats.inserted,
                    updated = run.stats.updated,
                    deleted = run.stats.deleted,
                    skipped = run.stats.skipped,
                    failed = run.stats.failed,
                    duration_ms = run.durations.total_ms,
                    "Sync completed"
                );
                let ctx = HookContext::new(guard.run_id(), mapping, sync_type, dry_run)
                    .with_stats(run.stats);
                self.hooks.run(HookPhase::PostSync, &ctx).await;
            }
            SyncStatus::Cancelled => {
                warn!(mapping_id = %mapping.id, %sync_type, "Sync cancelled");
            }
            _ => {
                error!(
                    mapping_id = %mapping.id,
                    %sync_type,
                    error = run.errors.last().map_or("", String::as_str),
                    "Sync failed"
                );
            }
        }

        SyncResult {
            run_id: guard.run_id(),
            mapping_id: mapping.id,
            sync_type,
            success: status == SyncStatus::Completed,
            status,
            stats: run.stats,
            durations: run.durations,
            errors: run.errors,
            dry_run,
        }
    }

    async fn run_phases(
        &self,
        guard: &RunGuard,
        mapping: &MappingConfig,
        fetch: Fetch,
        dry_run: bool,
        progress: &ProgressReporter,
        run: &mut RunState,
    ) -> Result<(), SyncError> {
        let sync_type = fetch.sync_type();
        let ctx = || HookContext::new(guard.run_id(), mapping, sync_type, dry_run);

        self.hooks.run(HookPhase::PreSync, &ctx()).await;
        guard.check()?;

        let filters = CompiledFilters::compile(&mapping.filters)?;
        let plan = QueryPlan::for_mapping(mapping);
        let prepared = self
            .transform
            .prepare(mapping, TransformOptions { dry_run })
            .await?;
        for warning in &prepared.lookup_stats().warnings {
            warn!(mapping_id = %mapping.id, warning = %warning, "Lookup table truncated");
        }

        // Fetch
        progress.emit(SyncPhase::Fetching, 0, 0, None);
        let fetch_started = Instant::now();
        let token = guard.token().clone();
        let mut stream = match fetch {
            Fetch::Bulk { timeout, .. } => self.source.bulk_records(&plan, Some(timeout), token),
            Fetch::Incremental { since } => self.source.incremental_records(&plan, since, token),
        };
        let mut records: Vec<Value> = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record?);
            run.stats.fetched += 1;
            if run.stats.fetched % PROGRESS_INTERVAL == 0 {
                progress.emit(SyncPhase::Fetching, run.stats.fetched, 0, None);
            }
            guard.check()?;
        }
        drop(stream);
        run.durations.fetch_ms = elapsed_ms(fetch_started);

        self.hooks
            .run(
                HookPhase::PostFetch,
                &ctx().with_records(&records).with_stats(run.stats),
            )
            .await;
        guard.check()?;

        // Filter
        let filter_started = Instant::now();
        let (passed, rejected): (Vec<Value>, Vec<Value>) =
            records.into_iter().partition(|r| filters.matches(r));
        run.stats.filtered = passed.len() as u64;
        run.stats.skipped = rejected.len() as u64;
        drop(rejected);
        run.durations.filter_ms = elapsed_ms(filter_started);

        // Transform
        progress.emit(SyncPhase::Transforming, run.stats.fetched, 0, None);
        let transform_started = Instant::now();
        let mut rows: Vec<Row> = Vec::with_capacity(passed.len());
        for record in &passed {
            let result = prepared.transform_record(record);
            let source_id = result.source_id.as_deref().unwrap_or("unknown");
            for field_error in &result.errors {
                run.push_error(format!("Record {source_id}: {field_error}"));
            }
            if result.status() == TransformStatus::Error {
                run.stats.failed += 1;
            } else {
                rows.push(result.row);
            }
            run.processed += 1;
            if run.processed % PROGRESS_INTERVAL == 0 {
                progress.emit(
                    SyncPhase::Transforming,
                    run.stats.fetched,
                    run.processed,
                    None,
                );
                guard.check()?;
            }
        }
        drop(prepared);
        drop(passed);
        run.durations.transform_ms = elapsed_ms(transform_started);

        self.hooks
            .run(
                HookPhase::PostTransform,
                &ctx().with_rows(&rows).with_stats(run.stats),
            )
            .await;
        guard.check()?;

        // Write
        if dry_run {
            info!(mapping_id = %mapping.id, rows = rows.len(), "Dry run, skipping write");
            return Ok(());
        }
        if rows.is_empty() {
            return Ok(());
        }
        let Some(key) = &mapping.key_mapping else {
            warn!(mapping_id = %mapping.id, "Mapping has no key mapping, skipping write");
            return Ok(());
        };

        progress.emit(SyncPhase::Writing, run.stats.fetched, run.processed, None);
        let write_started = Instant::now();
        let outcome = self
            .writer
            .upsert_rows(&mapping.target_table, &key.target_column, &rows)
            .await?;
        run.stats.inserted += outcome.inserted;
        run.stats.updated += outcome.updated;
        run.stats.failed += outcome.failed;
        for message in &outcome.errors {
            run.push_error(message.clone());
        }

        self.hooks
            .run(
                HookPhase::PostWrite,
                &ctx().with_rows(&rows).with_stats(run.stats),
            )
            .await;

        if let Fetch::Bulk {
            delete_stale: true, ..
        } = fetch
        {
            guard.check()?;
            if run.stats.failed > 0 {
                // Keys of failed records are unknown; their rows are not stale
                warn!(
                    mapping_id = %mapping.id,
                    failed = run.stats.failed,
                    "Records failed, skipping stale row deletion"
                );
                run.push_error(format!(
                    "Stale row deletion skipped: {} records failed",
                    run.stats.failed
                ));
            } else {
                run.stats.deleted = self
                    .writer
                    .delete_stale(&mapping.target_table, &key.target_column, &outcome.keys)
                    .await?;
            }
        }
        run.durations.write_ms = elapsed_ms(write_started);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use naked_pineapple_core::ResourceType;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::hooks::HookRegistration;
    use crate::hooks::tests::LogHook;
    use crate::memory::{
        MemoryHistoryStore, MemoryMappingCatalog, MemoryTargetWriter, ScriptedRecordSource,
    };

    struct Harness {
        orchestrator: Arc<SyncOrchestrator>,
        history: Arc<MemoryHistoryStore>,
        writer: Arc<MemoryTargetWriter>,
        source: Arc<ScriptedRecordSource>,
    }

    fn mapping(id: i32) -> MappingConfig {
        serde_json::from_value(json!({
            "id": id,
            "name": "products",
            "source_resource": ResourceType::Product,
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
        .unwrap()
    }

    fn product(n: u32, status: &str, price: &str) -> Value {
        json!({
            "id": format!("gid://shopify/Product/{n}"),
            "title": format!("Product {n}"),
            "status": status,
            "price": price
        })
    }

    fn harness(source: ScriptedRecordSource, hooks: Arc<HookRegistry>) -> Harness {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        catalog.insert(mapping(1));
        let history = Arc::new(MemoryHistoryStore::new());
        let writer = Arc::new(MemoryTargetWriter::new());
        let source = Arc::new(source);
        let orchestrator = Arc::new(SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog,
            history: history.clone(),
            source: source.clone(),
            writer: writer.clone(),
            hooks,
            settings: OrchestratorSettings::default(),
        }));
        Harness {
            orchestrator,
            history,
            writer,
            source,
        }
    }

    #[tokio::test]
    async fn test_full_sync_filters_transforms_and_writes() {
        let h = harness(
            ScriptedRecordSource::new(vec![
                product(1, "ACTIVE", "19.99"),
                product(2, "DRAFT", "5.00"),
                product(3, "ACTIVE", "abc"),
            ]),
            Arc::new(HookRegistry::new()),
        );

        let result = h
            .orchestrator
            .full_sync(MappingId::new(1), FullSyncOptions::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stats.fetched, 3);
        assert_eq!(result.stats.filtered, 2);
        assert_eq!(result.stats.skipped, 1);
        // Product 3 keeps its title and key, so it is partial and written.
        assert_eq!(result.stats.inserted, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Record gid://shopify/Product/3:"));

        let row = h.writer.row("products", "gid://shopify/Product/1").unwrap();
        assert_eq!(row["price"], json!("19.99"));
        assert!(h.writer.row("products", "gid://shopify/Product/2").is_none());

        let runs = h.history.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SyncStatus::Completed);
        assert_eq!(runs[0].id, result.run_id);
        assert!(!h.orchestrator.is_running(MappingId::new(1)));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let h = harness(
            ScriptedRecordSource::new(vec![product(1, "ACTIVE", "1.00")]),
            Arc::new(HookRegistry::new()),
        );
        let result = h
            .orchestrator
            .full_sync(
                MappingId::new(1),
                FullSyncOptions {
                    dry_run: true,
                    ..FullSyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(result.success && result.dry_run);
        assert!(h.writer.rows("products").is_empty());
    }

    #[tokio::test]
    async fn test_delete_stale_removes_missing_keys() {
        let h = harness(
            ScriptedRecordSource::new(vec![product(1, "ACTIVE", "1.00")]),
            Arc::new(HookRegistry::new()),
        );
        h.writer.insert_row(
            "products",
            "shopify_id",
            json!({ "shopify_id": "gid://shopify/Product/9", "title": "gone" }),
        );

        let result = h
            .orchestrator
            .full_sync(
                MappingId::new(1),
                FullSyncOptions {
                    delete_stale: true,
                    ..FullSyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.stats.deleted, 1);
        assert_eq!(h.writer.rows("products").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_stale_skipped_when_records_fail() {
        let h = harness(
            ScriptedRecordSource::new(vec![
                product(1, "ACTIVE", "1.00"),
                json!({ "title": "No id", "status": "ACTIVE", "price": "2.00" }),
            ]),
            Arc::new(HookRegistry::new()),
        );
        h.writer.insert_row(
            "products",
            "shopify_id",
            json!({ "shopify_id": "gid://shopify/Product/9", "title": "kept" }),
        );

        let result = h
            .orchestrator
            .full_sync(
                MappingId::new(1),
                FullSyncOptions {
                    delete_stale: true,
                    ..FullSyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.stats.failed, 1);
        assert_eq!(result.stats.deleted, 0);
        assert!(h.writer.row("products", "gid://shopify/Product/9").is_some());
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.starts_with("Stale row deletion skipped"))
        );
    }

    #[tokio::test]
    async fn test_unknown_mapping_is_an_error() {
        let h = harness(ScriptedRecordSource::default(), Arc::new(HookRegistry::new()));
        let err = h
            .orchestrator
            .incremental_sync(MappingId::new(99), IncrementalSyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MappingNotFound(_)));
        assert!(!h.orchestrator.is_running(MappingId::new(99)));
    }

    #[tokio::test]
    async fn test_incremental_uses_lookback_floor() {
        let h = harness(
            ScriptedRecordSource::new(vec![product(1, "ACTIVE", "2.50")]),
            Arc::new(HookRegistry::new()),
        );
        let before = Utc::now();
        let result = h
            .orchestrator
            .incremental_sync(
                MappingId::new(1),
                IncrementalSyncOptions {
                    lookback_minutes: 30,
                    ..IncrementalSyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.sync_type, SyncType::Incremental);

        let since = h.source.incremental_calls()[0];
        let expected = before - chrono::Duration::minutes(30);
        assert!((since - expected).num_seconds().abs() <= 5);
        assert_eq!(h.source.bulk_runs(), 0);
    }

    #[tokio::test]
    async fn test_bulk_failure_fails_run() {
        let h = harness(
            ScriptedRecordSource::new(vec![]).failing_bulk("INTERNAL_SERVER_ERROR"),
            Arc::new(HookRegistry::new()),
        );
        let result = h
            .orchestrator
            .full_sync(MappingId::new(1), FullSyncOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.errors.iter().any(|e| e.contains("INTERNAL_SERVER_ERROR")));
        assert_eq!(h.history.runs()[0].status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_during_bulk_poll() {
        let h = harness(
            ScriptedRecordSource::new(vec![]).stalled_bulk(),
            Arc::new(HookRegistry::new()),
        );
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .full_sync(MappingId::new(1), FullSyncOptions::default())
                .await
        });
        while !h.orchestrator.is_running(MappingId::new(1)) {
            tokio::task::yield_now().await;
        }
        // Let the bulk operation reach its poll loop.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.orchestrator.cancel(MappingId::new(1), "user requested"));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, SyncStatus::Cancelled);
        assert_eq!(result.errors.last().unwrap(), "Sync cancelled: user requested");
        assert_eq!(h.source.remote_cancels(), 1);
        assert_eq!(h.history.runs()[0].status, SyncStatus::Cancelled);
        assert!(!h.orchestrator.is_running(MappingId::new(1)));
    }

    #[tokio::test]
    async fn test_second_sync_rejected_while_running() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedRecordSource::new(vec![product(1, "ACTIVE", "1.00")])
                .with_gate(gate.clone()),
            Arc::new(HookRegistry::new()),
        );
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .full_sync(MappingId::new(1), FullSyncOptions::default())
                .await
        });
        while !h.orchestrator.is_running(MappingId::new(1)) {
            tokio::task::yield_now().await;
        }

        let err = h
            .orchestrator
            .incremental_sync(MappingId::new(1), IncrementalSyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));

        gate.notify_one();
        assert!(task.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn test_hooks_fire_in_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = Arc::new(HookRegistry::new());
        for (name, phase) in [
            ("post-sync", HookPhase::PostSync),
            ("pre-sync", HookPhase::PreSync),
            ("post-write", HookPhase::PostWrite),
            ("post-fetch", HookPhase::PostFetch),
            ("post-transform", HookPhase::PostTransform),
        ] {
            hooks.register(HookRegistration::new(
                name,
                phase,
                Arc::new(LogHook {
                    name,
                    log: log.clone(),
                    fail: name == "pre-sync",
                }),
            ));
        }
        let h = harness(
            ScriptedRecordSource::new(vec![product(1, "ACTIVE", "1.00")]),
            hooks,
        );

        let result = h
            .orchestrator
            .full_sync(MappingId::new(1), FullSyncOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "pre-sync:0",
                "post-fetch:1",
                "post-transform:1",
                "post-write:1",
                "post-sync:1"
            ]
        );
    }

    #[tokio::test]
    async fn test_progress_events_bracket_run() {
        let records = (1..=250).map(|n| product(n, "ACTIVE", "1.00")).collect();
        let h = harness(
            ScriptedRecordSource::new(records),
            Arc::new(HookRegistry::new()),
        );
        let mut rx = h.orchestrator.subscribe();
        h.orchestrator
            .incremental_sync(MappingId::new(1), IncrementalSyncOptions::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first().unwrap().phase, SyncPhase::Starting);
        assert_eq!(events.last().unwrap().phase, SyncPhase::Completed);
        let fetch_ticks: Vec<u64> = events
            .iter()
            .filter(|e| e.phase == SyncPhase::Fetching && e.fetched > 0)
            .map(|e| e.fetched)
            .collect();
        assert_eq!(fetch_ticks, vec![100, 200]);
    }

    #[tokio::test]
    async fn test_history_pruned_to_retention() {
        let catalog = Arc::new(MemoryMappingCatalog::new());
        catalog.insert(mapping(1));
        let history = Arc::new(MemoryHistoryStore::new());
        let orchestrator = SyncOrchestrator::new(SyncOrchestratorDeps {
            catalog,
            history: history.clone(),
            source: Arc::new(ScriptedRecordSource::default()),
            writer: Arc::new(MemoryTargetWriter::new()),
            hooks: Arc::new(HookRegistry::new()),
            settings: OrchestratorSettings {
                history_retention: 2,
                ..OrchestratorSettings::default()
            },
        });
        for _ in 0..4 {
            orchestrator
                .incremental_sync(MappingId::new(1), IncrementalSyncOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(history.runs().len(), 2);
    }
}
