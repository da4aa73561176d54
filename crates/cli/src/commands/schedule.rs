//! Cron pattern inspection.
//!
//! # Usage
//!
//! ```bash
//! # Describe a pattern and list its next runs
//! np-cli cron "0 */6 * * *" --timezone America/Los_Angeles --count 5
//!
//! # Check it against the floor for full syncs
//! np-cli cron "0 */6 * * *" --sync-type full
//! ```

use chrono::Utc;
use naked_pineapple_core::SyncType;
use naked_pineapple_sync::scheduler::{CronSchedule, SchedulerError, describe};

/// Print what a cron pattern means and when it fires next.
pub fn inspect(
    pattern: &str,
    timezone: &str,
    count: usize,
    sync_type: Option<SyncType>,
) -> Result<(), SchedulerError> {
    let schedule = CronSchedule::parse(pattern, timezone)?;
    let now = Utc::now();

    tracing::info!("{} ({})", describe(pattern), schedule.timezone());
    for run in schedule.upcoming(now, count) {
        tracing::info!("  {}", run.with_timezone(&schedule.timezone()));
    }

    if let Some(sync_type) = sync_type {
        schedule.validate_interval(sync_type, now)?;
        tracing::info!("Interval is allowed for {} syncs", sync_type);
    }
    Ok(())
}
