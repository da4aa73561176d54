//! Sync service configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `SYNC_DATABASE_URL` - `PostgreSQL` connection string for the service's own tables
//! - `SHOPIFY_STORE` - Shopify store domain (e.g., your-store.myshopify.com)
//! - `SHOPIFY_ACCESS_TOKEN` - Admin API access token (HIGH PRIVILEGE)
//! - `SHOPIFY_WEBHOOK_SECRET` - Shared secret for webhook HMAC verification
//!
//! ## Optional
//! - `SYNC_TARGET_DATABASE_URL` - Database mapped rows are written to (default: service DB)
//! - `SYNC_HOST` - Bind address (default: 127.0.0.1)
//! - `SYNC_PORT` - Listen port (default: 3002)
//! - `SHOPIFY_API_VERSION` - API version (default: 2026-01)
//! - `SYNC_BULK_TIMEOUT_SECS` - Bulk operation timeout (default: 600)
//! - `SYNC_WEBHOOK_CONCURRENCY` - Webhook jobs processed at once (default: 5)
//! - `SYNC_WEBHOOK_RATE_PER_SECOND` - Webhook jobs started per second (default: 10)
//! - `SYNC_WEBHOOK_MAX_ATTEMPTS` - Attempts before a webhook job is parked (default: 3)
//! - `SYNC_WEBHOOK_DEDUPE_TTL_SECS` - Duplicate webhook window (default: 86400)
//! - `SYNC_HISTORY_RETENTION` - Sync and webhook history entries kept (default: 1000)
//! - `SYNC_LOOKUP_MAX_ROWS` - Row cap per lookup table (default: 50000)
//! - `SYNC_SCHEDULER_TICK_SECS` - Schedule check interval (default: 30)
//! - `SYNC_FAILURE_ALERT_THRESHOLD` - Consecutive failures that alert (default: 3)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name
//! - `SENTRY_SAMPLE_RATE` / `SENTRY_TRACES_SAMPLE_RATE` - Sample rates (default: 1.0)

use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::orchestrator::OrchestratorSettings;
use crate::scheduler::SchedulerSettings;
use crate::webhook::WebhookWorkerSettings;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;
const DEFAULT_API_VERSION: &str = "2026-01";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Sync service configuration.
#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
    /// Service database URL (contains password)
    pub database_url: SecretString,
    /// Target database URL; `None` writes into the service database
    pub target_database_url: Option<SecretString>,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Shopify Admin API configuration
    pub shopify: ShopifyConfig,
    /// Default bulk operation timeout
    pub bulk_timeout: Duration,
    pub webhook_concurrency: usize,
    pub webhook_rate_per_second: u32,
    pub webhook_max_attempts: u32,
    /// Window in which a repeated webhook id is dropped
    pub webhook_dedupe_ttl: Duration,
    /// History entries kept per table after pruning
    pub history_retention: u64,
    /// Row cap per lookup table
    pub lookup_max_rows: usize,
    pub scheduler_tick: Duration,
    pub failure_alert_threshold: u32,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "staging", "production")
    pub sentry_environment: Option<String>,
    /// Sentry error sample rate (0.0 to 1.0)
    pub sentry_sample_rate: f32,
    /// Sentry traces sample rate for performance monitoring (0.0 to 1.0)
    pub sentry_traces_sample_rate: f32,
}

/// Shopify Admin API configuration.
///
/// Implements `Debug` manually to redact the HIGH PRIVILEGE credentials.
#[derive(Clone)]
pub struct ShopifyConfig {
    /// Shopify store domain (e.g., your-store.myshopify.com)
    pub store: String,
    /// Shopify API version (e.g., 2026-01)
    pub api_version: String,
    /// Admin API access token (HIGH PRIVILEGE - full store access)
    pub access_token: SecretString,
    /// Webhook HMAC secret
    pub webhook_secret: SecretString,
}

impl std::fmt::Debug for ShopifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyConfig")
            .field("store", &self.store)
            .field("api_version", &self.api_version)
            .field("access_token", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

impl ShopifyConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            store: parse_store_domain(&get_required_env("SHOPIFY_STORE")?)?,
            api_version: get_env_or_default("SHOPIFY_API_VERSION", DEFAULT_API_VERSION),
            access_token: get_validated_secret("SHOPIFY_ACCESS_TOKEN")?,
            webhook_secret: get_validated_secret("SHOPIFY_WEBHOOK_SECRET")?,
        })
    }
}

impl SyncServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if secrets fail validation (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("SYNC_DATABASE_URL")?;
        let target_database_url = get_optional_env("SYNC_TARGET_DATABASE_URL").map(SecretString::from);
        let host = parse_env("SYNC_HOST", "127.0.0.1")?;
        let port = parse_env("SYNC_PORT", "3002")?;
        let shopify = ShopifyConfig::from_env()?;

        let config = Self {
            database_url,
            target_database_url,
            host,
            port,
            shopify,
            bulk_timeout: Duration::from_secs(parse_env("SYNC_BULK_TIMEOUT_SECS", "600")?),
            webhook_concurrency: parse_env("SYNC_WEBHOOK_CONCURRENCY", "5")?,
            webhook_rate_per_second: parse_env("SYNC_WEBHOOK_RATE_PER_SECOND", "10")?,
            webhook_max_attempts: parse_env("SYNC_WEBHOOK_MAX_ATTEMPTS", "3")?,
            webhook_dedupe_ttl: Duration::from_secs(parse_env(
                "SYNC_WEBHOOK_DEDUPE_TTL_SECS",
                "86400",
            )?),
            history_retention: parse_env("SYNC_HISTORY_RETENTION", "1000")?,
            lookup_max_rows: parse_env("SYNC_LOOKUP_MAX_ROWS", "50000")?,
            scheduler_tick: Duration::from_secs(parse_env("SYNC_SCHEDULER_TICK_SECS", "30")?),
            failure_alert_threshold: parse_env("SYNC_FAILURE_ALERT_THRESHOLD", "3")?,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
            sentry_sample_rate: get_optional_env("SENTRY_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            sentry_traces_sample_rate: get_optional_env("SENTRY_TRACES_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("SYNC_WEBHOOK_CONCURRENCY", u64::try_from(self.webhook_concurrency).unwrap_or(u64::MAX)),
            ("SYNC_WEBHOOK_RATE_PER_SECOND", u64::from(self.webhook_rate_per_second)),
            ("SYNC_WEBHOOK_MAX_ATTEMPTS", u64::from(self.webhook_max_attempts)),
            ("SYNC_SCHEDULER_TICK_SECS", self.scheduler_tick.as_secs()),
            ("SYNC_BULK_TIMEOUT_SECS", self.bulk_timeout.as_secs()),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidEnvVar(
                    key.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Database mapped rows are written to.
    #[must_use]
    pub fn target_database_url(&self) -> &SecretString {
        self.target_database_url.as_ref().unwrap_or(&self.database_url)
    }

    #[must_use]
    pub const fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            history_retention: self.history_retention,
            lookup_max_rows: self.lookup_max_rows,
            bulk_timeout: self.bulk_timeout,
        }
    }

    #[must_use]
    pub fn webhook_settings(&self) -> WebhookWorkerSettings {
        WebhookWorkerSettings {
            concurrency: self.webhook_concurrency,
            rate_per_second: self.webhook_rate_per_second,
            max_attempts: self.webhook_max_attempts,
            history_retention: self.history_retention,
            ..WebhookWorkerSettings::default()
        }
    }

    #[must_use]
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: self.scheduler_tick,
            failure_threshold: self.failure_alert_threshold,
            ..SchedulerSettings::default()
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Normalise `SHOPIFY_STORE` to a bare host (`shop.myshopify.com`).
///
/// A scheme and trailing slash are tolerated; paths, ports and credentials
/// are not.
fn parse_store_domain(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim().trim_end_matches('/');
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let invalid = |reason: &str| {
        ConfigError::InvalidEnvVar("SHOPIFY_STORE".to_string(), reason.to_string())
    };

    let url = url::Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "https" {
        return Err(invalid("store must be reached over https"));
    }
    if url.path() != "/" || url.query().is_some() || url.port().is_some() {
        return Err(invalid("expected a bare store domain"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials belong in SHOPIFY_ACCESS_TOKEN"));
    }
    match url.host() {
        Some(url::Host::Domain(domain)) if domain.contains('.') => Ok(domain.to_string()),
        _ => Err(invalid("expected a store domain such as shop.myshopify.com")),
    }
}

/// Get database URL with fallback to generic `DATABASE_URL` (used by Fly.io postgres attach).
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default`.
fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    parse_value(key, &get_env_or_default(key, default))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}
