//! Status enums for sync runs, webhook jobs, and mapping behaviour.
//!
//! All statuses are persisted as lowercase text and round-trip through
//! `Display`/`FromStr`.

use serde::{Deserialize, Serialize};

/// Kind of synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Complete re-extraction through a bulk export operation.
    Full,
    /// Records updated since a timestamp, fetched page by page.
    #[default]
    Incremental,
    /// A single record delivered by a webhook.
    Webhook,
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

impl std::str::FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "webhook" => Ok(Self::Webhook),
            _ => Err(format!("invalid sync type: {s}")),
        }
    }
}

/// Lifecycle status of a sync run.
///
/// A run starts as `Running` and ends in exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl SyncStatus {
    /// Whether the run has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid sync status: {s}")),
        }
    }
}

/// Outcome of processing one inbound webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid webhook status: {s}")),
        }
    }
}

/// How delete-type webhooks are applied to the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStrategy {
    /// Delete the row matching the record key.
    Hard,
    /// Stamp the configured timestamp column on the matching row.
    Soft,
    /// Leave the target table untouched.
    #[default]
    Ignore,
}

impl std::fmt::Display for DeleteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hard => write!(f, "hard"),
            Self::Soft => write!(f, "soft"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_roundtrip() {
        for status in [
            SyncStatus::Running,
            SyncStatus::Completed,
            SyncStatus::Failed,
            SyncStatus::Cancelled,
            SyncStatus::Skipped,
        ] {
            let parsed: SyncStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_sync_status_terminal() {
        assert!(!SyncStatus::Running.is_terminal());
        assert!(SyncStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_sync_type_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&SyncType::Incremental).unwrap(),
            "\"incremental\""
        );
        assert!("bulk".parse::<SyncType>().is_err());
    }

    #[test]
    fn test_delete_strategy_default_is_ignore() {
        assert_eq!(DeleteStrategy::default(), DeleteStrategy::Ignore);
    }
}
