//! One-off sync commands.
//!
//! Runs a sync in-process against the same databases and Shopify store the
//! service uses. The service does not need to be running, but a sync
//! started here is invisible to its in-memory exclusivity check.
//!
//! # Usage
//!
//! ```bash
//! # Full sync of mapping 3, deleting rows no longer in Shopify
//! np-cli sync full 3 --delete-stale
//!
//! # Incremental sync of the last two hours without writing
//! np-cli sync incremental 3 --lookback 120 --dry-run
//!
//! # Mark runs interrupted by a crash as failed
//! np-cli sync recover
//! ```
//!
//! # Environment Variables
//!
//! Same as the service: `SYNC_DATABASE_URL`, `SYNC_TARGET_DATABASE_URL`,
//! `SHOPIFY_STORE`, `SHOPIFY_ACCESS_TOKEN`, `SHOPIFY_WEBHOOK_SECRET`.

use std::time::Duration;

use naked_pineapple_core::MappingId;
use naked_pineapple_sync::config::{ConfigError, SyncServiceConfig};
use naked_pineapple_sync::db;
use naked_pineapple_sync::error::SyncError;
use naked_pineapple_sync::orchestrator::{FullSyncOptions, IncrementalSyncOptions, SyncResult};
use naked_pineapple_sync::service::{ServicePools, SyncService};
use thiserror::Error;

/// Errors that can occur while running a sync from the command line.
#[derive(Debug, Error)]
pub enum SyncCommandError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Sync finished with status {0}")]
    Unsuccessful(String),
}

async fn connect() -> Result<SyncService, SyncCommandError> {
    let config = SyncServiceConfig::from_env()?;

    tracing::info!("Connecting to sync databases...");
    let pools = ServicePools {
        service: db::create_pool(&config.database_url).await?,
        target: db::create_pool(config.target_database_url()).await?,
    };

    let service = SyncService::build(&config, pools).await;
    service.prepare().await?;
    Ok(service)
}

fn report(result: &SyncResult) -> Result<(), SyncCommandError> {
    tracing::info!(
        "{} sync of mapping {} finished: {}",
        result.sync_type,
        result.mapping_id,
        result.status
    );
    tracing::info!(
        "  fetched {}, inserted {}, updated {}, deleted {}, skipped {}, failed {}",
        result.stats.fetched,
        result.stats.inserted,
        result.stats.updated,
        result.stats.deleted,
        result.stats.skipped,
        result.stats.failed
    );
    for error in &result.errors {
        tracing::warn!("  {}", error);
    }

    if result.success {
        Ok(())
    } else {
        Err(SyncCommandError::Unsuccessful(result.status.to_string()))
    }
}

/// Run a full sync and wait for it.
pub async fn full(
    mapping_id: i32,
    dry_run: bool,
    delete_stale: bool,
    bulk_timeout_secs: Option<u64>,
) -> Result<(), SyncCommandError> {
    let service = connect().await?;
    let result = service
        .orchestrator()
        .full_sync(
            MappingId::new(mapping_id),
            FullSyncOptions {
                dry_run,
                delete_stale,
                bulk_timeout: bulk_timeout_secs.map(Duration::from_secs),
            },
        )
        .await?;
    report(&result)
}

/// Run an incremental sync and wait for it.
pub async fn incremental(
    mapping_id: i32,
    dry_run: bool,
    lookback_minutes: u32,
) -> Result<(), SyncCommandError> {
    let service = connect().await?;
    let result = service
        .orchestrator()
        .incremental_sync(
            MappingId::new(mapping_id),
            IncrementalSyncOptions {
                dry_run,
                since: None,
                lookback_minutes,
            },
        )
        .await?;
    report(&result)
}

/// Mark runs left `running` by a crashed process as failed.
pub async fn recover() -> Result<(), SyncCommandError> {
    // Connecting runs the sweep.
    connect().await?;
    tracing::info!("Stale runs recovered");
    Ok(())
}
