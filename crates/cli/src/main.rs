//! Naked Pineapple CLI - Migrations and sync management tools.
//!
//! # Usage
//!
//! ```bash
//! # Run sync database migrations
//! np-cli migrate
//!
//! # Run a full sync of mapping 3 and wait for it
//! np-cli sync full 3 --delete-stale
//!
//! # Run an incremental sync over the last hour
//! np-cli sync incremental 3 --lookback 60
//!
//! # Mark interrupted runs as failed
//! np-cli sync recover
//!
//! # Explain a cron pattern
//! np-cli cron "0 */6 * * *" --timezone America/New_York
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `sync` - Run syncs without the service
//! - `cron` - Describe a schedule pattern and its next runs

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use naked_pineapple_core::{DEFAULT_LOOKBACK_MINUTES, SyncType};

mod commands;

#[derive(Parser)]
#[command(name = "np-cli")]
#[command(author, version, about = "Naked Pineapple CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync database migrations
    Migrate,
    /// Run syncs directly against the configured store
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Describe a cron pattern and list its next runs
    Cron {
        /// Five-field cron pattern
        pattern: String,

        /// IANA timezone the pattern is evaluated in
        #[arg(short, long, default_value = "UTC")]
        timezone: String,

        /// How many upcoming runs to list
        #[arg(short, long, default_value_t = 5)]
        count: usize,

        /// Check the pattern against this sync type's minimum interval
        #[arg(short, long)]
        sync_type: Option<SyncType>,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Re-extract every record through a bulk operation
    Full {
        /// Mapping to sync
        mapping_id: i32,

        /// Transform without writing
        #[arg(long)]
        dry_run: bool,

        /// Delete target rows no longer present in Shopify
        #[arg(long)]
        delete_stale: bool,

        /// Give up on the bulk operation after this many seconds
        #[arg(long)]
        bulk_timeout: Option<u64>,
    },
    /// Fetch records updated within the lookback window
    Incremental {
        /// Mapping to sync
        mapping_id: i32,

        /// Transform without writing
        #[arg(long)]
        dry_run: bool,

        /// Minutes to look back from now
        #[arg(short, long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u32,
    },
    /// Mark runs left running by a crashed process as failed
    Recover,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::sync().await?,
        Commands::Sync { action } => match action {
            SyncAction::Full {
                mapping_id,
                dry_run,
                delete_stale,
                bulk_timeout,
            } => commands::sync::full(mapping_id, dry_run, delete_stale, bulk_timeout).await?,
            SyncAction::Incremental {
                mapping_id,
                dry_run,
                lookback,
            } => commands::sync::incremental(mapping_id, dry_run, lookback).await?,
            SyncAction::Recover => commands::sync::recover().await?,
        },
        Commands::Cron {
            pattern,
            timezone,
            count,
            sync_type,
        } => commands::schedule::inspect(&pattern, &timezone, count, sync_type)?,
    }
    Ok(())
}
