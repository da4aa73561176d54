//! In-memory implementations of every persistence seam.
//!
//! Used by unit and integration tests. [`ScriptedRecordSource`] stands in
//! for Shopify.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use moka::Expiry;
use moka::future::Cache;
use naked_pineapple_core::{
    MappingConfig, MappingId, ResourceType, SyncHistoryEntry, SyncStatus, WebhookHistoryEntry,
};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{
    HistoryStore, IdempotencyStore, MappingCatalog, RepositoryError, STALE_RUN_MESSAGE,
    ScheduleStore, StoredSchedule, WebhookJob, WebhookQueue,
};
use crate::record::display_value;
use crate::shopify::bulk::ByteStream;
use crate::shopify::source::bulk_stream;
use crate::shopify::{
    BulkApi, BulkOperation, BulkOperationStatus, BulkPollConfig, QueryPlan, RecordSource,
    RecordStream, ShopifyError,
};
use crate::store::{StoreError, TargetWriter, UpsertOutcome};
use crate::transform::Row;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Mappings
// =============================================================================

/// Mapping catalog held in a map.
#[derive(Debug, Default)]
pub struct MemoryMappingCatalog {
    mappings: Mutex<BTreeMap<MappingId, MappingConfig>>,
}

impl MemoryMappingCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a mapping.
    pub fn insert(&self, mapping: MappingConfig) {
        lock(&self.mappings).insert(mapping.id, mapping);
    }
}

#[async_trait]
impl MappingCatalog for MemoryMappingCatalog {
    async fn get(&self, id: MappingId) -> Result<Option<MappingConfig>, RepositoryError> {
        Ok(lock(&self.mappings).get(&id).cloned())
    }

    async fn list_enabled_for_resource(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<MappingConfig>, RepositoryError> {
        Ok(lock(&self.mappings)
            .values()
            .filter(|m| m.enabled && m.source_resource == resource)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<MappingConfig>, RepositoryError> {
        Ok(lock(&self.mappings).values().cloned().collect())
    }
}

// =============================================================================
// History
// =============================================================================

/// Sync and webhook history held in vectors, oldest first.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    runs: Mutex<Vec<SyncHistoryEntry>>,
    webhooks: Mutex<Vec<WebhookHistoryEntry>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored run, oldest first.
    #[must_use]
    pub fn runs(&self) -> Vec<SyncHistoryEntry> {
        lock(&self.runs).clone()
    }

    /// Every stored webhook outcome, oldest first.
    #[must_use]
    pub fn webhooks(&self) -> Vec<WebhookHistoryEntry> {
        lock(&self.webhooks).clone()
    }
}

fn prune_front<T>(items: &mut Vec<T>, keep: u64) -> u64 {
    let keep = usize::try_from(keep).unwrap_or(usize::MAX);
    let excess = items.len().saturating_sub(keep);
    items.drain(..excess);
    excess as u64
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError> {
        lock(&self.runs).push(entry.clone());
        Ok(())
    }

    async fn complete_run(&self, entry: &SyncHistoryEntry) -> Result<(), RepositoryError> {
        let mut runs = lock(&self.runs);
        let stored = runs
            .iter_mut()
            .find(|r| r.id == entry.id)
            .ok_or(RepositoryError::NotFound)?;
        *stored = entry.clone();
        Ok(())
    }

    async fn list_runs(
        &self,
        mapping_id: MappingId,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>, RepositoryError> {
        Ok(lock(&self.runs)
            .iter()
            .rev()
            .filter(|r| r.mapping_id == mapping_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fail_stale_runs(&self) -> Result<u64, RepositoryError> {
        let mut swept = 0;
        for run in lock(&self.runs)
            .iter_mut()
            .filter(|r| r.status == SyncStatus::Running)
        {
            run.status = SyncStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.errors.push(STALE_RUN_MESSAGE.to_string());
            swept += 1;
        }
        Ok(swept)
    }

    async fn prune(&self, keep: u64) -> Result<u64, RepositoryError> {
        Ok(prune_front(&mut lock(&self.runs), keep))
    }

    async fn record_webhook(&self, entry: &WebhookHistoryEntry) -> Result<(), RepositoryError> {
        lock(&self.webhooks).push(entry.clone());
        Ok(())
    }

    async fn prune_webhooks(&self, keep: u64) -> Result<u64, RepositoryError> {
        Ok(prune_front(&mut lock(&self.webhooks), keep))
    }
}

// =============================================================================
// Schedules
// =============================================================================

/// Schedule definitions held in a map.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<BTreeMap<MappingId, StoredSchedule>>,
}

impl MemoryScheduleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, schedule: &StoredSchedule) -> Result<(), RepositoryError> {
        let mut schedules = lock(&self.schedules);
        let mut schedule = schedule.clone();
        if let Some(existing) = schedules.get(&schedule.mapping_id) {
            schedule.last_run_at = existing.last_run_at;
            schedule.last_status = existing.last_status;
        }
        schedules.insert(schedule.mapping_id, schedule);
        Ok(())
    }

    async fn remove(&self, mapping_id: MappingId) -> Result<bool, RepositoryError> {
        Ok(lock(&self.schedules).remove(&mapping_id).is_some())
    }

    async fn get(&self, mapping_id: MappingId) -> Result<Option<StoredSchedule>, RepositoryError> {
        Ok(lock(&self.schedules).get(&mapping_id).cloned())
    }

    async fn list(&self) -> Result<Vec<StoredSchedule>, RepositoryError> {
        Ok(lock(&self.schedules).values().cloned().collect())
    }

    async fn set_next_run(
        &self,
        mapping_id: MappingId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        if let Some(s) = lock(&self.schedules).get_mut(&mapping_id) {
            s.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn record_run(
        &self,
        mapping_id: MappingId,
        at: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), RepositoryError> {
        if let Some(s) = lock(&self.schedules).get_mut(&mapping_id) {
            s.last_run_at = Some(at);
            s.last_status = Some(status);
        }
        Ok(())
    }
}

// =============================================================================
// Webhook queue and dedupe
// =============================================================================

/// State of a job in [`MemoryWebhookQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job: WebhookJob,
    state: JobState,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// Webhook queue held in a vector, FIFO by arrival.
#[derive(Debug, Default)]
pub struct MemoryWebhookQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryWebhookQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State and last error of a job.
    #[must_use]
    pub fn state(&self, id: Uuid) -> Option<(JobState, Option<String>)> {
        lock(&self.jobs)
            .iter()
            .find(|j| j.job.id == id)
            .map(|j| (j.state, j.last_error.clone()))
    }

    /// Number of jobs in `state`.
    #[must_use]
    pub fn count(&self, state: JobState) -> usize {
        lock(&self.jobs).iter().filter(|j| j.state == state).count()
    }
}

#[async_trait]
impl WebhookQueue for MemoryWebhookQueue {
    async fn push(&self, job: &WebhookJob) -> Result<(), RepositoryError> {
        lock(&self.jobs).push(QueuedJob {
            job: job.clone(),
            state: JobState::Pending,
            available_at: job.received_at,
            last_error: None,
        });
        Ok(())
    }

    async fn claim(&self, limit: usize) -> Result<Vec<WebhookJob>, RepositoryError> {
        let now = Utc::now();
        Ok(lock(&self.jobs)
            .iter_mut()
            .filter(|j| j.state == JobState::Pending && j.available_at <= now)
            .take(limit)
            .map(|j| {
                j.state = JobState::Processing;
                j.job.attempts += 1;
                j.job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), RepositoryError> {
        if let Some(j) = lock(&self.jobs).iter_mut().find(|j| j.job.id == id) {
            j.state = JobState::Completed;
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        if let Some(j) = lock(&self.jobs).iter_mut().find(|j| j.job.id == id) {
            j.last_error = Some(error.to_string());
            match retry_at {
                Some(at) => {
                    j.state = JobState::Pending;
                    j.available_at = at;
                }
                None => j.state = JobState::Failed,
            }
        }
        Ok(())
    }
}

struct ClaimTtl;

impl Expiry<String, Duration> for ClaimTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        ttl: &Duration,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(*ttl)
    }
}

/// Dedupe keys held in a moka cache with per-key expiry.
#[derive(Debug, Clone)]
pub struct MemoryIdempotencyStore {
    keys: Cache<String, Duration>,
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Cache::builder()
                .max_capacity(100_000)
                .expire_after(ClaimTtl)
                .build(),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, RepositoryError> {
        Ok(self.keys.entry(key.to_string()).or_insert(ttl).await.is_fresh())
    }
}

// =============================================================================
// Target writer
// =============================================================================

/// Target tables held as key-ordered maps of rows.
#[derive(Debug, Default)]
pub struct MemoryTargetWriter {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    rejected: Mutex<HashSet<String>>,
}

impl MemoryTargetWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row. Non-object values and rows without the key are ignored.
    pub fn insert_row(&self, table: &str, key_column: &str, row: Value) {
        let Value::Object(row) = row else {
            return;
        };
        let Some(key) = row.get(key_column).filter(|v| !v.is_null()).map(display_value) else {
            return;
        };
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    /// Make every write to `table` fail.
    pub fn reject_table(&self, table: &str) {
        lock(&self.rejected).insert(table.to_string());
    }

    /// Rows of a table in key order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// One row by key.
    #[must_use]
    pub fn row(&self, table: &str, key: &str) -> Option<Row> {
        lock(&self.tables).get(table).and_then(|t| t.get(key).cloned())
    }

    fn check(&self, table: &str) -> Result<(), StoreError> {
        if lock(&self.rejected).contains(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetWriter for MemoryTargetWriter {
    async fn upsert_rows(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> Result<UpsertOutcome, StoreError> {
        self.check(table)?;
        let mut outcome = UpsertOutcome::default();
        let mut tables = lock(&self.tables);
        let stored = tables.entry(table.to_string()).or_default();

        for row in rows {
            let Some(key) = row.get(key_column).filter(|v| !v.is_null()).map(display_value) else {
                outcome.failed += 1;
                outcome
                    .errors
                    .push(format!("Row is missing key column '{key_column}'"));
                continue;
            };
            match stored.get_mut(&key) {
                Some(existing) => {
                    existing.extend(row.clone());
                    outcome.updated += 1;
                }
                None => {
                    stored.insert(key.clone(), row.clone());
                    outcome.inserted += 1;
                }
            }
            outcome.keys.push(key);
        }
        Ok(outcome)
    }

    async fn delete_stale(
        &self,
        table: &str,
        _key_column: &str,
        keep_keys: &[String],
    ) -> Result<u64, StoreError> {
        self.check(table)?;
        if keep_keys.is_empty() {
            return Ok(0);
        }
        let keep: HashSet<&String> = keep_keys.iter().collect();
        let mut tables = lock(&self.tables);
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|key, _| keep.contains(key));
        Ok((before - stored.len()) as u64)
    }

    async fn delete_by_key(
        &self,
        table: &str,
        _key_column: &str,
        key: &str,
    ) -> Result<u64, StoreError> {
        self.check(table)?;
        Ok(lock(&self.tables)
            .get_mut(table)
            .and_then(|t| t.remove(key))
            .map_or(0, |_| 1))
    }

    async fn soft_delete_by_key(
        &self,
        table: &str,
        _key_column: &str,
        key: &str,
        column: &str,
    ) -> Result<u64, StoreError> {
        self.check(table)?;
        let mut tables = lock(&self.tables);
        let Some(row) = tables.get_mut(table).and_then(|t| t.get_mut(key)) else {
            return Ok(0);
        };
        row.insert(
            column.to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Ok(1)
    }

    async fn load_lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        limit: usize,
    ) -> Result<Vec<(Value, Value)>, StoreError> {
        self.check(table)?;
        Ok(lock(&self.tables)
            .get(table)
            .map(|t| {
                t.values()
                    .filter_map(|row| {
                        let m = row.get(match_column).filter(|v| !v.is_null())?;
                        Some((
                            m.clone(),
                            row.get(return_column).cloned().unwrap_or(Value::Null),
                        ))
                    })
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Record source
// =============================================================================

/// Replays canned records through the bulk and pagination seams.
///
/// Full syncs go through the real bulk polling protocol against a scripted
/// status sequence, so failures and cancellation behave as they would
/// against Shopify.
#[derive(Debug, Default)]
pub struct ScriptedRecordSource {
    records: Mutex<Vec<Value>>,
    bulk_statuses: Mutex<Vec<BulkOperation>>,
    gate: Option<Arc<Notify>>,
    since: Mutex<Vec<DateTime<Utc>>>,
    bulk_runs: AtomicUsize,
    remote_cancels: Arc<AtomicUsize>,
}

impl ScriptedRecordSource {
    #[must_use]
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// Bulk operations poll `RUNNING` once, then fail with `error_code`.
    #[must_use]
    pub fn failing_bulk(self, error_code: &str) -> Self {
        *lock(&self.bulk_statuses) = vec![
            scripted_operation(BulkOperationStatus::Running, None),
            scripted_operation(BulkOperationStatus::Failed, Some(error_code)),
        ];
        self
    }

    /// Bulk operations never leave `RUNNING`.
    #[must_use]
    pub fn stalled_bulk(self) -> Self {
        *lock(&self.bulk_statuses) =
            vec![scripted_operation(BulkOperationStatus::Running, None)];
        self
    }

    /// Hold every stream until `gate` is notified.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Replace the records served by later fetches.
    pub fn set_records(&self, records: Vec<Value>) {
        *lock(&self.records) = records;
    }

    /// `since` bounds of every incremental fetch so far.
    #[must_use]
    pub fn incremental_calls(&self) -> Vec<DateTime<Utc>> {
        lock(&self.since).clone()
    }

    /// Bulk operations started so far.
    #[must_use]
    pub fn bulk_runs(&self) -> usize {
        self.bulk_runs.load(Ordering::SeqCst)
    }

    /// Remote cancel requests issued by the bulk protocol.
    #[must_use]
    pub fn remote_cancels(&self) -> usize {
        self.remote_cancels.load(Ordering::SeqCst)
    }

    fn gated(&self, stream: RecordStream) -> RecordStream {
        let Some(gate) = self.gate.clone() else {
            return stream;
        };
        async_stream::stream! {
            gate.notified().await;
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                yield item;
            }
        }
        .boxed()
    }
}

fn scripted_operation(status: BulkOperationStatus, error_code: Option<&str>) -> BulkOperation {
    BulkOperation {
        id: "gid://shopify/BulkOperation/0".to_string(),
        status,
        error_code: error_code.map(String::from),
        object_count: None,
        url: (status == BulkOperationStatus::Completed)
            .then(|| "memory://bulk.jsonl".to_string()),
        partial_data_url: None,
    }
}

struct ScriptedBulkApi {
    statuses: Mutex<VecDeque<BulkOperation>>,
    body: String,
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl BulkApi for ScriptedBulkApi {
    async fn submit(&self, _query: &str) -> Result<BulkOperation, ShopifyError> {
        Ok(scripted_operation(BulkOperationStatus::Created, None))
    }

    async fn status(&self, _id: &str) -> Result<BulkOperation, ShopifyError> {
        let mut statuses = lock(&self.statuses);
        let next = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(next.unwrap_or_else(|| scripted_operation(BulkOperationStatus::Completed, None)))
    }

    async fn cancel(&self, _id: &str) -> Result<(), ShopifyError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, _url: &str) -> Result<ByteStream, ShopifyError> {
        let bytes = self.body.clone().into_bytes();
        Ok(futures::stream::iter(vec![Ok(bytes)]).boxed())
    }
}

impl RecordSource for ScriptedRecordSource {
    fn bulk_records(
        &self,
        plan: &QueryPlan,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> RecordStream {
        self.bulk_runs.fetch_add(1, Ordering::SeqCst);
        let body: String = lock(&self.records)
            .iter()
            .map(|r| format!("{r}\n"))
            .collect();
        let api = ScriptedBulkApi {
            statuses: Mutex::new(lock(&self.bulk_statuses).clone().into()),
            body,
            cancels: self.remote_cancels.clone(),
        };
        let poll = BulkPollConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            backoff: 1.5,
            timeout: timeout.unwrap_or(Duration::from_secs(5)),
        };
        self.gated(bulk_stream(api, poll, plan.bulk_query(), cancel))
    }

    fn incremental_records(
        &self,
        _plan: &QueryPlan,
        since: DateTime<Utc>,
        _cancel: CancellationToken,
    ) -> RecordStream {
        lock(&self.since).push(since);
        let records = lock(&self.records).clone();
        self.gated(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }
}
