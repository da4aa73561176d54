//! Cron patterns: parsing, interval floors and human-readable descriptions.
//!
//! Schedules are written as classic five-field patterns
//! (`minute hour day-of-month month day-of-week`, `0`/`7` = Sunday). The
//! `cron` crate wants a leading seconds field and numbers days `1`–`7`
//! starting on Sunday, so patterns are translated before parsing.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use naked_pineapple_core::SyncType;

use super::SchedulerError;

/// Shortest allowed gap between incremental runs.
pub const MIN_INCREMENTAL_INTERVAL: Duration = Duration::minutes(5);

/// Shortest allowed gap between full runs.
pub const MIN_FULL_INTERVAL: Duration = Duration::hours(6);

/// Occurrences sampled when measuring the tightest gap of a pattern.
const INTERVAL_SAMPLES: usize = 24;

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// A validated pattern bound to its timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pattern: String,
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse a five-field pattern evaluated in `timezone` (IANA name).
    ///
    /// # Errors
    ///
    /// `InvalidPattern` / `InvalidTimezone` when either does not parse.
    pub fn parse(pattern: &str, timezone: &str) -> Result<Self, SchedulerError> {
        let timezone = Tz::from_str(timezone.trim())
            .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))?;
        let translated = translate(pattern)?;
        let schedule = cron::Schedule::from_str(&translated)
            .map_err(|e| SchedulerError::InvalidPattern(format!("{pattern}: {e}")))?;

        Ok(Self {
            pattern: pattern.trim().to_string(),
            schedule,
            timezone,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.upcoming(after, 1).into_iter().next()
    }

    /// The next `count` occurrences after `after`, in UTC.
    #[must_use]
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .take(count)
            .map(|at| at.with_timezone(&Utc))
            .collect()
    }

    /// Tightest gap between consecutive occurrences after `from`.
    ///
    /// `None` when the pattern fires fewer than twice.
    #[must_use]
    pub fn min_interval(&self, from: DateTime<Utc>) -> Option<Duration> {
        self.upcoming(from, INTERVAL_SAMPLES)
            .windows(2)
            .filter_map(|pair| match pair {
                [a, b] => Some(*b - *a),
                _ => None,
            })
            .min()
    }

    /// Reject patterns that fire more often than `sync_type` allows.
    ///
    /// # Errors
    ///
    /// `IntervalTooShort` naming the floor and the observed gap.
    pub fn validate_interval(
        &self,
        sync_type: SyncType,
        from: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let minimum = minimum_interval(sync_type)?;
        let Some(actual) = self.min_interval(from) else {
            return Ok(());
        };
        if actual < minimum {
            return Err(SchedulerError::IntervalTooShort {
                sync_type,
                pattern: self.pattern.clone(),
                minimum: format_duration(minimum),
                actual: format_duration(actual),
            });
        }
        Ok(())
    }
}

/// Floor for `sync_type`; webhook syncs are never scheduled.
///
/// # Errors
///
/// `UnsupportedSyncType` for [`SyncType::Webhook`].
pub const fn minimum_interval(sync_type: SyncType) -> Result<Duration, SchedulerError> {
    match sync_type {
        SyncType::Incremental => Ok(MIN_INCREMENTAL_INTERVAL),
        SyncType::Full => Ok(MIN_FULL_INTERVAL),
        SyncType::Webhook => Err(SchedulerError::UnsupportedSyncType(sync_type)),
    }
}

/// Turn a five-field pattern into the `cron` crate's seconds-first form.
fn translate(pattern: &str) -> Result<String, SchedulerError> {
    let trimmed = pattern.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        return Err(SchedulerError::InvalidPattern(format!(
            "{pattern}: expected 5 fields, got {}",
            fields.len()
        )));
    };

    let dow = dow
        .split(',')
        .map(|part| {
            translate_weekday(part)
                .map_err(|reason| SchedulerError::InvalidPattern(format!("{pattern}: {reason}")))
        })
        .collect::<Result<Vec<_>, _>>()?
        .join(",");

    Ok(format!("0 {minute} {hour} {dom} {month} {dow}"))
}

/// Shift one day-of-week list element from `0`–`7` (Sunday = 0 or 7) to
/// `1`–`7` (Sunday = 1). Names pass through; stepped numeric ranges become
/// explicit lists.
fn translate_weekday(part: &str) -> Result<String, String> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };
    let with_step = |base: String| match step {
        Some(step) => format!("{base}/{step}"),
        None => base,
    };

    if base == "*" || base == "?" || base.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(part.to_string());
    }

    let day = |s: &str| -> Result<u32, String> {
        s.parse::<u32>()
            .ok()
            .filter(|d| *d <= 7)
            .ok_or_else(|| format!("invalid day of week '{s}'"))
    };

    let (start, end) = match base.split_once('-') {
        Some((start, end)) => (day(start)?, day(end)?),
        None if step.is_some() => (day(base)?, 7),
        None => return Ok((day(base)? % 7 + 1).to_string()),
    };
    if start == 0 && end == 7 {
        return Ok(with_step("*".to_string()));
    }
    if step.is_none() {
        // `5-7` would wrap to `6-1` once shifted
        return Ok(if end == 7 && start > 0 {
            format!("{}-7,1", start % 7 + 1)
        } else {
            format!("{}-{}", start % 7 + 1, end % 7 + 1)
        });
    }

    // Stepped ranges are expanded so the shift cannot wrap mid-range.
    let step = step
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|s| *s > 0)
        .ok_or_else(|| format!("invalid step in '{part}'"))?;
    if start > end {
        return Err(format!("invalid day range '{base}'"));
    }
    let days: BTreeSet<u32> = (start..=end).step_by(step).map(|d| d % 7 + 1).collect();
    Ok(days
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Human-readable rendering of common patterns.
///
/// Falls back to `Cron: <pattern>` for anything not recognised.
#[must_use]
pub fn describe(pattern: &str) -> String {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    let fallback = || format!("Cron: {}", pattern.trim());

    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        return fallback();
    };
    if *dom != "*" || *month != "*" {
        return fallback();
    }

    let every = |field: &str| -> Option<u32> {
        match field {
            "*" => Some(1),
            _ => field.strip_prefix("*/")?.parse().ok(),
        }
    };
    let number = |field: &str| field.parse::<u32>().ok();

    match (*minute, *hour, *dow) {
        (m, "*", "*") if every(m).is_some() => match every(m) {
            Some(1) => "Every minute".to_string(),
            Some(n) => format!("Every {n} minutes"),
            None => fallback(),
        },
        ("0", "*", "*") => "Every hour".to_string(),
        (m, "*", "*") if number(m).is_some() => match number(m) {
            Some(m) => format!("Every hour at minute {m}"),
            None => fallback(),
        },
        ("0", h, "*") if h.starts_with("*/") => match every(h) {
            Some(n) => format!("Every {n} hours"),
            None => fallback(),
        },
        (m, h, d) => match (number(m), number(h)) {
            (Some(m), Some(h)) if m < 60 && h < 24 => {
                if d == "*" {
                    format!("Daily at {h:02}:{m:02}")
                } else if let Some(name) = number(d)
                    .and_then(|d| usize::try_from(d % 7).ok())
                    .and_then(|d| WEEKDAYS.get(d))
                {
                    format!("Weekly on {name} at {h:02}:{m:02}")
                } else {
                    fallback()
                }
            }
            _ => fallback(),
        },
    }
}

fn format_duration(duration: Duration) -> String {
    let minutes = duration.num_minutes();
    if minutes >= 60 && minutes % 60 == 0 {
        let hours = minutes / 60;
        if hours == 1 {
            "1 hour".to_string()
        } else {
            format!("{hours} hours")
        }
    } else if minutes == 1 {
        "1 minute".to_string()
    } else if minutes > 0 {
        format!("{minutes} minutes")
    } else {
        format!("{} seconds", duration.num_seconds())
    }
}
