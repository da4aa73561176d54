//! Recurring sync schedule configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::MappingId;
use super::status::{SyncStatus, SyncType};

/// Default lookback window for scheduled incremental syncs.
pub const DEFAULT_LOOKBACK_MINUTES: u32 = 15;

/// Per-mapping recurring job descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub sync_type: SyncType,
    /// Five-field cron pattern (`minute hour day-of-month month day-of-week`).
    pub pattern: String,
    /// IANA timezone the pattern is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Incremental only: how far back each run looks.
    #[serde(default)]
    pub lookback_minutes: Option<u32>,
    /// Full only: delete target rows missing from the export.
    #[serde(default)]
    pub delete_stale: bool,
}

impl ScheduleConfig {
    /// Effective lookback for incremental runs.
    #[must_use]
    pub fn lookback(&self) -> u32 {
        self.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES)
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Runtime view of a mapping's schedule, derived from the stored definition
/// and recent outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerInfo {
    pub mapping_id: MappingId,
    pub job_id: String,
    pub enabled: bool,
    pub sync_type: SyncType,
    pub pattern: String,
    pub timezone: String,
    /// Human-readable rendering of the pattern.
    pub description: String,
    pub next_runs: Vec<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub consecutive_failures: u32,
    /// Whether consecutive failures reached the alert threshold.
    pub alerting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let config: ScheduleConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "sync_type": "incremental",
            "pattern": "*/15 * * * *"
        }))
        .unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.lookback(), DEFAULT_LOOKBACK_MINUTES);
        assert!(!config.delete_stale);
    }
}
