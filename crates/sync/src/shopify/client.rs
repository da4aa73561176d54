//! Rate-limited Shopify Admin API GraphQL client.
//!
//! Queries are raw GraphQL documents built from mapping configuration, so the
//! client works with `serde_json::Value` rather than generated types.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::throttle::{CALL_LIMIT_HEADER, ThrottleBucket};
use super::{GraphQLError, GraphQLErrorLocation, ShopifyError};

/// Default retry limits for a single query.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const MAX_ERROR_BODY: usize = 500;

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    ///
    /// A server-provided `Retry-After` wins when it is longer.
    #[must_use]
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        retry_after.map_or(backoff, |ra| backoff.max(ra.min(self.max_delay)))
    }
}

/// Shopify Admin API GraphQL client.
///
/// One client exists per `(store, api_version)` pair; clones share the
/// HTTP connection pool and the throttle bucket.
///
/// # Security
///
/// This client carries an Admin API access token with HIGH PRIVILEGE access
/// to the store. Only use on Tailscale-protected infrastructure.
#[derive(Clone)]
pub struct ShopifyClient {
    inner: Arc<ShopifyClientInner>,
}

struct ShopifyClientInner {
    client: reqwest::Client,
    store: String,
    api_version: String,
    access_token: SecretString,
    bucket: Mutex<ThrottleBucket>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ShopifyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyClient")
            .field("store", &self.inner.store)
            .field("api_version", &self.inner.api_version)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// GraphQL request body.
#[derive(Debug, Serialize)]
struct GraphQLRequest<'a> {
    query: &'a str,
    variables: &'a Value,
}

/// GraphQL response wrapper.
#[derive(Debug, Deserialize)]
struct GraphQLResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphQLErrorResponse>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLErrorResponse {
    message: String,
    #[serde(default)]
    locations: Vec<GraphQLErrorLocationResponse>,
    #[serde(default)]
    path: Vec<Value>,
    #[serde(default)]
    extensions: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GraphQLErrorLocationResponse {
    line: i64,
    column: i64,
}

impl From<GraphQLErrorResponse> for GraphQLError {
    fn from(e: GraphQLErrorResponse) -> Self {
        let code = e
            .extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
            .map(String::from);
        Self {
            message: e.message,
            locations: e
                .locations
                .into_iter()
                .map(|l| GraphQLErrorLocation {
                    line: l.line,
                    column: l.column,
                })
                .collect(),
            path: e.path,
            code,
        }
    }
}

impl ShopifyClient {
    /// Create a new Admin API client.
    ///
    /// # Arguments
    ///
    /// * `store` - Store domain (e.g. `your-store.myshopify.com`)
    /// * `api_version` - Admin API version (e.g. `2026-01`)
    /// * `access_token` - Admin API access token
    #[must_use]
    pub fn new(store: &str, api_version: &str, access_token: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(ShopifyClientInner {
                client,
                store: store.to_string(),
                api_version: api_version.to_string(),
                access_token,
                bucket: Mutex::new(ThrottleBucket::default()),
                retry: RetryPolicy::default(),
            }),
        }
    }

    /// Get the store domain.
    #[must_use]
    pub fn store(&self) -> &str {
        &self.inner.store
    }

    /// Get the API version.
    #[must_use]
    pub fn api_version(&self) -> &str {
        &self.inner.api_version
    }

    /// The underlying HTTP client (used for bulk result downloads).
    #[must_use]
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.client
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            self.inner.store, self.inner.api_version
        )
    }

    // =========================================================================
    // GraphQL Execution
    // =========================================================================

    /// Execute a GraphQL document and return its `data` object.
    ///
    /// Waits before sending when the estimated call-limit usage is above 80%,
    /// and retries throttled or transient failures with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns `ShopifyError::Unauthorized` immediately on 401/403.
    /// Returns `ShopifyError::GraphQL` when the response carries errors.
    /// Returns the last retryable error once `max_retries` is exhausted.
    #[instrument(skip(self, query, variables), fields(store = %self.inner.store))]
    pub async fn query(
        &self,
        query: &str,
        variables: Value,
        max_retries: u32,
    ) -> Result<Value, ShopifyError> {
        let mut attempt = 0;
        loop {
            self.wait_for_capacity().await;

            match self.send_once(query, &variables).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let retry_after = match &e {
                        ShopifyError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
                        _ => None,
                    };
                    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                    let delay = self.inner.retry.delay(attempt, retry_after) + jitter;
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying Shopify query"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_for_capacity(&self) {
        let delay = self
            .inner
            .bucket
            .lock()
            .await
            .delay_before_call(Instant::now());
        if !delay.is_zero() {
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Throttling before Shopify call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(&self, query: &str, variables: &Value) -> Result<Value, ShopifyError> {
        let body = GraphQLRequest { query, variables };

        let response = self
            .inner
            .client
            .post(self.endpoint())
            .header(ACCESS_TOKEN_HEADER, self.inner.access_token.expose_secret())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if let Some(limit) = response
            .headers()
            .get(CALL_LIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.inner
                .bucket
                .lock()
                .await
                .observe(limit, Instant::now());
        }

        let status = response.status();

        // Check for rate limiting
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .map_or(2, |secs| secs.ceil().max(0.0) as u64);
            return Err(ShopifyError::RateLimited(retry_after));
        }

        // Credentials are the problem, not load
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ShopifyError::Unauthorized(format!(
                "Shopify rejected the access token (HTTP {})",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            text.truncate(MAX_ERROR_BODY);
            return Err(ShopifyError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let graphql_response: GraphQLResponse = response.json().await?;
        extract_data(graphql_response)
    }
}

/// Turn a GraphQL envelope into its data, or the concatenated errors.
fn extract_data(response: GraphQLResponse) -> Result<Value, ShopifyError> {
    if let Some(errors) = response.errors
        && !errors.is_empty()
    {
        return Err(ShopifyError::GraphQL(
            errors.into_iter().map(GraphQLError::from).collect(),
        ));
    }

    response
        .data
        .ok_or_else(|| ShopifyError::UnexpectedResponse("No data in response".to_string()))
}

/// Collect `userErrors` from a mutation payload into a single error.
pub(crate) fn check_user_errors(payload: &Value) -> Result<(), ShopifyError> {
    let Some(errors) = payload.get("userErrors").and_then(Value::as_array) else {
        return Ok(());
    };
    if errors.is_empty() {
        return Ok(());
    }
    let message = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ShopifyError::UserError(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay(3, None), Duration::from_secs(8));
        assert_eq!(policy.delay(10, None), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_extends_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_extract_data_concatenates_errors() {
        let response: GraphQLResponse = serde_json::from_value(serde_json::json!({
            "data": null,
            "errors": [
                { "message": "first" },
                { "message": "second", "extensions": { "code": "THROTTLED" } }
            ]
        }))
        .unwrap();
        let err = extract_data(response).unwrap_err();
        assert_eq!(err.to_string(), "GraphQL errors: first; second");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_extract_data_requires_data() {
        let response: GraphQLResponse =
            serde_json::from_value(serde_json::json!({ "data": null })).unwrap();
        assert!(matches!(
            extract_data(response),
            Err(ShopifyError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_check_user_errors() {
        let ok = serde_json::json!({ "userErrors": [] });
        assert!(check_user_errors(&ok).is_ok());

        let bad = serde_json::json!({
            "userErrors": [{ "field": ["query"], "message": "Invalid bulk query" }]
        });
        let err = check_user_errors(&bad).unwrap_err();
        assert_eq!(err.to_string(), "User error: Invalid bulk query");
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = ShopifyClient::new(
            "test.myshopify.com",
            "2026-01",
            SecretString::from("shpat_secret".to_string()),
        );
        let debug = format!("{client:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("shpat_secret"));
    }
}
