//! Database migration commands.
//!
//! # Usage
//!
//! ```bash
//! np-cli migrate
//! ```
//!
//! # Environment Variables
//!
//! - `SYNC_DATABASE_URL` - `PostgreSQL` connection string for the sync schema
//!   (falls back to `DATABASE_URL`)
//!
//! # Migration Files
//!
//! Sync migrations: `crates/sync/migrations/`

use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use thiserror::Error;

/// Errors that can occur while migrating.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// The sync database URL, read the same way the service reads it.
pub fn database_url() -> Result<SecretString, MigrationError> {
    dotenvy::dotenv().ok();

    std::env::var("SYNC_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map(SecretString::from)
        .map_err(|_| MigrationError::MissingEnvVar("SYNC_DATABASE_URL"))
}

/// Run the sync schema migrations.
pub async fn sync() -> Result<(), MigrationError> {
    let database_url = database_url()?;

    tracing::info!("Connecting to sync database...");
    let pool = PgPool::connect(database_url.expose_secret()).await?;

    tracing::info!("Running sync migrations...");
    sqlx::migrate!("../sync/migrations").run(&pool).await?;

    tracing::info!("Sync migrations complete!");
    Ok(())
}
