//! Sync lifecycle hooks.
//!
//! Hooks run at five points of a sync run, sequentially by ascending
//! priority. A failing hook is logged and reported in its [`HookResult`];
//! it never stops the next hook or the sync itself.

pub mod backup;

pub use backup::{BackupRetentionHook, DEFAULT_BACKUPS_KEPT, TableBackupHook, register_builtin_hooks};

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use naked_pineapple_core::{MappingConfig, MappingId, SyncStats, SyncType};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::StoreError;
use crate::transform::Row;

/// Point in a sync run where hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreSync,
    PostFetch,
    PostTransform,
    PostWrite,
    PostSync,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreSync => write!(f, "pre-sync"),
            Self::PostFetch => write!(f, "post-fetch"),
            Self::PostTransform => write!(f, "post-transform"),
            Self::PostWrite => write!(f, "post-write"),
            Self::PostSync => write!(f, "post-sync"),
        }
    }
}

/// Errors raised by hook handlers.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What a hook sees of the run.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub run_id: Uuid,
    pub mapping: &'a MappingConfig,
    pub sync_type: SyncType,
    pub dry_run: bool,
    /// Raw records (post-fetch).
    pub records: &'a [Value],
    /// Transformed rows (post-transform, post-write).
    pub rows: &'a [Row],
    /// Counters so far (post-write, post-sync).
    pub stats: SyncStats,
}

impl<'a> HookContext<'a> {
    /// A context with no records, rows or counters.
    #[must_use]
    pub const fn new(
        run_id: Uuid,
        mapping: &'a MappingConfig,
        sync_type: SyncType,
        dry_run: bool,
    ) -> Self {
        Self {
            run_id,
            mapping,
            sync_type,
            dry_run,
            records: &[],
            rows: &[],
            stats: SyncStats {
                fetched: 0,
                filtered: 0,
                skipped: 0,
                inserted: 0,
                updated: 0,
                deleted: 0,
                failed: 0,
            },
        }
    }

    #[must_use]
    pub const fn with_records(mut self, records: &'a [Value]) -> Self {
        self.records = records;
        self
    }

    #[must_use]
    pub const fn with_rows(mut self, rows: &'a [Row]) -> Self {
        self.rows = rows;
        self
    }

    #[must_use]
    pub const fn with_stats(mut self, stats: SyncStats) -> Self {
        self.stats = stats;
        self
    }
}

/// An async lifecycle callback.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError>;
}

/// A hook with its phase, priority and filters.
#[derive(Clone)]
pub struct HookRegistration {
    pub id: String,
    pub phase: HookPhase,
    /// Lower runs first.
    pub priority: i32,
    /// Restrict to these mappings; `None` means all.
    pub mapping_ids: Option<Vec<MappingId>>,
    /// Restrict to these sync types; `None` means all.
    pub sync_types: Option<Vec<SyncType>>,
    pub hook: Arc<dyn Hook>,
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl HookRegistration {
    /// Priority 100, no filters.
    #[must_use]
    pub fn new(id: impl Into<String>, phase: HookPhase, hook: Arc<dyn Hook>) -> Self {
        Self {
            id: id.into(),
            phase,
            priority: 100,
            mapping_ids: None,
            sync_types: None,
            hook,
        }
    }

    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn for_mappings(mut self, ids: Vec<MappingId>) -> Self {
        self.mapping_ids = Some(ids);
        self
    }

    #[must_use]
    pub fn for_sync_types(mut self, types: Vec<SyncType>) -> Self {
        self.sync_types = Some(types);
        self
    }

    fn applies(&self, phase: HookPhase, ctx: &HookContext<'_>) -> bool {
        self.phase == phase
            && self
                .mapping_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&ctx.mapping.id))
            && self
                .sync_types
                .as_ref()
                .is_none_or(|types| types.contains(&ctx.sync_type))
    }
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookResult {
    pub hook_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Registered hooks, shared by every sync run.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<HookRegistration>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. An existing hook with the same id is replaced.
    pub fn register(&self, registration: HookRegistration) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = hooks.iter().position(|h| h.id == registration.id) {
            warn!(hook_id = %registration.id, "Replacing existing hook registration");
            hooks.remove(pos);
        }
        debug!(hook_id = %registration.id, phase = %registration.phase, "Hook registered");
        hooks.push(registration);
    }

    /// Remove a hook. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every applicable hook for `phase`, in priority order.
    pub async fn run(&self, phase: HookPhase, ctx: &HookContext<'_>) -> Vec<HookResult> {
        let mut applicable: Vec<HookRegistration> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.applies(phase, ctx))
            .cloned()
            .collect();
        // Stable sort keeps registration order among equal priorities.
        applicable.sort_by_key(|h| h.priority);

        let mut results = Vec::with_capacity(applicable.len());
        for registration in applicable {
            let started = Instant::now();
            let outcome = registration.hook.run(ctx).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let error = match outcome {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        hook_id = %registration.id,
                        phase = %phase,
                        mapping_id = %ctx.mapping.id,
                        error = %e,
                        "Hook failed"
                    );
                    Some(e.to_string())
                }
            };
            results.push(HookResult {
                hook_id: registration.id,
                success: error.is_none(),
                duration_ms,
                error,
            });
        }
        results
    }
}
