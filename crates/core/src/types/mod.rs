//! Core types for the Naked Pineapple sync service.
//!
//! This module provides the mapping configuration model and the audit
//! records shared by the sync service and its tooling.

pub mod history;
pub mod id;
pub mod mapping;
pub mod schedule;
pub mod status;

pub use history::{
    MAX_HISTORY_ERRORS, SyncDurations, SyncHistoryEntry, SyncStats, WebhookHistoryEntry,
    truncate_errors,
};
pub use id::*;
pub use mapping::{
    CoerceType, FieldMapping, FieldSource, Filter, FilterOperator, KeyMapping, MappingConfig,
    ResourceType, SourceAlias, TargetColumn, Transform, WebhookSettings,
};
pub use schedule::{DEFAULT_LOOKBACK_MINUTES, ScheduleConfig, SchedulerInfo};
pub use status::*;
