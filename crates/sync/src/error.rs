//! Unified error handling for the sync service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use naked_pineapple_core::{MappingId, SyncType};
use thiserror::Error;

use crate::config::ConfigError;
use crate::db::RepositoryError;
use crate::filter::FilterError;
use crate::scheduler::SchedulerError;
use crate::shopify::ShopifyError;
use crate::store::StoreError;
use crate::transform::TransformError;
use crate::webhook::WebhookError;

/// Errors surfaced by sync operations.
///
/// Only `MappingNotFound`, `AlreadyRunning` and `Repository` escape the
/// orchestrator; the rest end up in a failed `SyncResult`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Mapping {0} not found")]
    MappingNotFound(MappingId),

    #[error("A {running} sync is already running for mapping {mapping_id}")]
    AlreadyRunning {
        mapping_id: MappingId,
        running: SyncType,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Shopify(#[from] ShopifyError),

    #[error("Target store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Sync cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Whether this error represents a cancelled run.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::Shopify(ShopifyError::Cancelled(_))
        )
    }
}

/// Application-level error type for the HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Sync operation failed.
    #[error("Sync error: {0}")]
    Sync(SyncError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Webhook signature missing or invalid.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Conflicts with a running sync.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::MappingNotFound(_) => Self::NotFound(err.to_string()),
            SyncError::AlreadyRunning { .. } => Self::Conflict(err.to_string()),
            SyncError::Repository(e) => Self::Database(e),
            SyncError::Scheduler(e) => e.into(),
            SyncError::Transform(_) | SyncError::Filter(_) => Self::BadRequest(err.to_string()),
            other => Self::Sync(other),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Repository(e) => Self::Database(e),
            SchedulerError::MappingNotFound(_) => Self::NotFound(err.to_string()),
            SchedulerError::QueueClosed => Self::Internal(err.to_string()),
            _ => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => Self::Unauthorized(err.to_string()),
            WebhookError::MissingHeader(_) | WebhookError::InvalidPayload(_) => {
                Self::BadRequest(err.to_string())
            }
            WebhookError::Repository(e) => Self::Database(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Database(_) | Self::Internal(_) | Self::Sync(_)) {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Sync request error"
            );
        }

        let status = match &self {
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Sync(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        // Don't expose internal error details to clients
        let message = match &self {
            Self::Database(_) | Self::Internal(_) => "Internal server error".to_string(),
            Self::Sync(_) => "Sync failed".to_string(),
            _ => self.to_string(),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::AlreadyRunning {
            mapping_id: MappingId::new(4),
            running: SyncType::Full,
        };
        assert_eq!(
            err.to_string(),
            "A full sync is already running for mapping 4"
        );
        assert_eq!(
            SyncError::Cancelled("user requested".into()).to_string(),
            "Sync cancelled: user requested"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(SyncError::Cancelled("x".into()).is_cancellation());
        assert!(SyncError::Shopify(ShopifyError::Cancelled("x".into())).is_cancellation());
        assert!(!SyncError::MappingNotFound(MappingId::new(1)).is_cancellation());
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            status(SyncError::MappingNotFound(MappingId::new(1))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SyncError::AlreadyRunning {
                mapping_id: MappingId::new(1),
                running: SyncType::Incremental,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(SchedulerError::InvalidPattern("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(AppError::Unauthorized("bad hmac".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(AppError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
