//! Client-side estimate of Shopify's leaky-bucket call limit.
//!
//! Shopify reports `used/capacity` in `X-Shopify-Shop-Api-Call-Limit`. Between
//! responses the bucket drains at a fixed restore rate, so the estimate decays
//! the last observed value by the elapsed time.

use std::time::{Duration, Instant};

/// Header carrying the bucket state.
pub const CALL_LIMIT_HEADER: &str = "X-Shopify-Shop-Api-Call-Limit";

const DEFAULT_CAPACITY: f64 = 40.0;
const DEFAULT_RESTORE_RATE: f64 = 2.0;
const THROTTLE_THRESHOLD: f64 = 0.8;
const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(5);

/// Last observed bucket state.
#[derive(Debug, Clone)]
pub struct ThrottleBucket {
    used: f64,
    capacity: f64,
    restore_rate: f64,
    observed_at: Option<Instant>,
}

impl Default for ThrottleBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RESTORE_RATE)
    }
}

impl ThrottleBucket {
    /// Create an empty bucket.
    #[must_use]
    pub const fn new(capacity: f64, restore_rate: f64) -> Self {
        Self {
            used: 0.0,
            capacity,
            restore_rate,
            observed_at: None,
        }
    }

    /// Estimated usage at `now`.
    #[must_use]
    pub fn estimated_usage(&self, now: Instant) -> f64 {
        let Some(observed_at) = self.observed_at else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(observed_at).as_secs_f64();
        (self.used - elapsed * self.restore_rate).max(0.0)
    }

    /// How long to wait before the next call, if at all.
    ///
    /// Zero while the estimate stays under 80% of capacity; otherwise long
    /// enough to drain back to the threshold, capped at five seconds.
    #[must_use]
    pub fn delay_before_call(&self, now: Instant) -> Duration {
        let threshold = self.capacity * THROTTLE_THRESHOLD;
        let estimated = self.estimated_usage(now);
        if estimated <= threshold || self.restore_rate <= 0.0 {
            return Duration::ZERO;
        }
        let secs = (estimated - threshold) / self.restore_rate;
        Duration::from_secs_f64(secs).min(MAX_THROTTLE_DELAY)
    }

    /// Update from a `used/capacity` header value. Malformed values are ignored.
    pub fn observe(&mut self, header: &str, now: Instant) -> bool {
        let Some((used, capacity)) = parse_call_limit(header) else {
            return false;
        };
        self.used = used;
        if capacity > 0.0 {
            self.capacity = capacity;
        }
        self.observed_at = Some(now);
        true
    }

    /// Capacity from the last observation.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }
}

fn parse_call_limit(header: &str) -> Option<(f64, f64)> {
    let (used, capacity) = header.trim().split_once('/')?;
    let used: f64 = used.trim().parse().ok()?;
    let capacity: f64 = capacity.trim().parse().ok()?;
    (used.is_finite() && capacity.is_finite()).then_some((used, capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_bucket_never_throttles() {
        let bucket = ThrottleBucket::default();
        assert_eq!(bucket.delay_before_call(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_observe_parses_header() {
        let mut bucket = ThrottleBucket::default();
        let now = Instant::now();
        assert!(bucket.observe("32/80", now));
        assert!((bucket.capacity() - 80.0).abs() < f64::EPSILON);
        assert!((bucket.estimated_usage(now) - 32.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_observe_ignores_garbage() {
        let mut bucket = ThrottleBucket::default();
        assert!(!bucket.observe("lots", Instant::now()));
        assert!(!bucket.observe("1/", Instant::now()));
    }

    #[test]
    fn test_usage_decays_over_time() {
        let mut bucket = ThrottleBucket::default();
        let start = Instant::now();
        bucket.observe("38/40", start);
        let later = start + Duration::from_secs(3);
        assert!((bucket.estimated_usage(later) - 32.0).abs() < 1e-9);
        let much_later = start + Duration::from_secs(60);
        assert!(bucket.estimated_usage(much_later).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_above_threshold() {
        let mut bucket = ThrottleBucket::default();
        let now = Instant::now();
        bucket.observe("36/40", now);
        // threshold 32, excess 4, restore 2/s
        assert_eq!(bucket.delay_before_call(now), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut bucket = ThrottleBucket::new(1000.0, 1.0);
        let now = Instant::now();
        bucket.observe("1000/1000", now);
        assert_eq!(bucket.delay_before_call(now), MAX_THROTTLE_DELAY);
    }
}
