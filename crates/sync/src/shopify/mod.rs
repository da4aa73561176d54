//! Shopify Admin API connector (HIGH PRIVILEGE - Tailscale only).
//!
//! # Architecture
//!
//! - [`ShopifyClient`] issues raw GraphQL documents, tracks the call-limit
//!   bucket reported by Shopify, and retries throttled or transient failures
//! - [`BulkOperationRunner`] drives the bulk export protocol used by full
//!   syncs (submit, poll, stream JSONL)
//! - [`incremental`] pages through `updated_at`-filtered connections
//! - [`RecordSource`] is the seam the orchestrator pulls records through
//!
//! # Example
//!
//! ```rust,ignore
//! use naked_pineapple_sync::shopify::{ShopifyClientPool, ShopifyRecordSource};
//!
//! let pool = ShopifyClientPool::new(access_token);
//! let client = pool.get("your-store.myshopify.com", "2026-01").await;
//! let source = ShopifyRecordSource::new(client);
//! ```

pub mod bulk;
pub mod client;
pub mod incremental;
pub mod jsonl;
pub mod pool;
pub mod query;
pub mod source;
pub mod throttle;

pub use bulk::{BulkApi, BulkOperation, BulkOperationRunner, BulkOperationStatus, BulkPollConfig};
pub use client::ShopifyClient;
pub use pool::ShopifyClientPool;
pub use query::QueryPlan;
pub use source::{RecordSource, RecordStream, ShopifyRecordSource};
pub use throttle::ThrottleBucket;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when interacting with the Shopify Admin API.
#[derive(Debug, Error)]
pub enum ShopifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// GraphQL query returned errors.
    #[error("GraphQL errors: {}", format_graphql_errors(.0))]
    GraphQL(Vec<GraphQLError>),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Still rate limited after exhausting retries.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Authentication/authorization failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success HTTP status that survived all retries.
    #[error("Shopify returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// User error from mutation (e.g., invalid bulk query).
    #[error("User error: {0}")]
    UserError(String),

    /// A bulk operation ended in a non-successful terminal state.
    #[error("Bulk operation {status}: {}", error_code.as_deref().unwrap_or("no error code"))]
    BulkOperationFailed {
        /// Terminal status reported by Shopify.
        status: BulkOperationStatus,
        /// Shopify error code (e.g. `INTERNAL_SERVER_ERROR`).
        error_code: Option<String>,
    },

    /// The bulk operation did not finish within the allowed time.
    #[error("Bulk operation timed out after {} seconds", .0.as_secs())]
    BulkOperationTimeout(Duration),

    /// The caller cancelled the operation.
    #[error("Sync cancelled: {0}")]
    Cancelled(String),

    /// Response did not have the expected shape.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ShopifyError {
    /// Whether the request may succeed if repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::GraphQL(errors) => errors.iter().any(GraphQLError::is_throttled),
            _ => false,
        }
    }
}

/// A GraphQL error returned by the Shopify Admin API.
#[derive(Debug, Clone)]
pub struct GraphQLError {
    /// Error message.
    pub message: String,
    /// Source locations in the query.
    pub locations: Vec<GraphQLErrorLocation>,
    /// Path to the error in the response.
    pub path: Vec<serde_json::Value>,
    /// `extensions.code`, when present (e.g. `THROTTLED`).
    pub code: Option<String>,
}

impl GraphQLError {
    /// Whether this error reports cost-based throttling.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.code.as_deref() == Some("THROTTLED")
    }
}

/// Location in a GraphQL query where an error occurred.
#[derive(Debug, Clone)]
pub struct GraphQLErrorLocation {
    /// Line number (1-indexed).
    pub line: i64,
    /// Column number (1-indexed).
    pub column: i64,
}

fn format_graphql_errors(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.clone())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphql_error(message: &str, code: Option<&str>) -> GraphQLError {
        GraphQLError {
            message: message.to_string(),
            locations: vec![],
            path: vec![],
            code: code.map(String::from),
        }
    }

    #[test]
    fn test_graphql_error_formatting() {
        let err = ShopifyError::GraphQL(vec![
            graphql_error("Field not found", None),
            graphql_error("Invalid ID", None),
        ]);
        assert_eq!(
            err.to_string(),
            "GraphQL errors: Field not found; Invalid ID"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_throttled_graphql_error_is_retryable() {
        let err = ShopifyError::GraphQL(vec![graphql_error("Throttled", Some("THROTTLED"))]);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bulk_failure_message_includes_code() {
        let err = ShopifyError::BulkOperationFailed {
            status: BulkOperationStatus::Failed,
            error_code: Some("INTERNAL_SERVER_ERROR".to_string()),
        };
        assert_eq!(err.to_string(), "Bulk operation FAILED: INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn test_status_retryability() {
        let server = ShopifyError::Status {
            status: 502,
            body: String::new(),
        };
        let client = ShopifyError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!ShopifyError::Unauthorized("bad token".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_message() {
        let err = ShopifyError::Cancelled("user requested".to_string());
        assert_eq!(err.to_string(), "Sync cancelled: user requested");
    }
}
