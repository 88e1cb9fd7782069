//! Fixed-window counter state and the admission decision derived from it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-key counter for a single fixed window.
///
/// Owned by a [`CounterStore`](super::store::CounterStore); everyone else only
/// sees copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// When the current window started (epoch ms)
    pub window_start: u64,
    /// When the current window ends (epoch ms), always `window_start + window`
    pub reset_time: u64,
}

impl CounterRecord {
    /// Open a new window at `now` with a count of one.
    pub fn open(now: u64, window: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            reset_time: now.saturating_add(window_millis(window)),
        }
    }

    /// A record is expired from the instant its reset time is reached.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.reset_time
    }

    /// Length of this record's window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.reset_time - self.window_start)
    }
}

pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The rule's maximum, `None` when no rule applied
    pub limit: Option<u64>,
    /// Requests left in the window, `None` when unlimited
    pub remaining: Option<u64>,
    /// Next window boundary (epoch ms)
    pub reset_time: u64,
    /// Seconds until `reset_time`, only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Start of the window the request was counted in, `None` when nothing
    /// was counted. Identifies that window to [`release`].
    ///
    /// [`release`]: super::RateLimiter::release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<u64>,
}

impl AdmissionResult {
    /// An allowance that consumed no quota.
    pub fn unlimited(limit: Option<u64>, reset_time: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: None,
            reset_time,
            retry_after: None,
            window_start: None,
        }
    }

    /// Derive the decision for `record` under a limit of `max_requests`.
    pub fn from_record(record: &CounterRecord, max_requests: u64, now: u64) -> Self {
        let allowed = record.count <= max_requests;
        let retry_after = if allowed {
            None
        } else {
            Some(record.reset_time.saturating_sub(now).div_ceil(1000))
        };

        Self {
            allowed,
            limit: Some(max_requests),
            remaining: Some(max_requests.saturating_sub(record.count)),
            reset_time: record.reset_time,
            retry_after,
            window_start: Some(record.window_start),
        }
    }

    /// Reset time in whole epoch seconds, as sent in `X-RateLimit-Reset`.
    pub fn reset_time_secs(&self) -> u64 {
        self.reset_time.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_record() {
        let record = CounterRecord::open(1_000, Duration::from_secs(60));
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, 1_000);
        assert_eq!(record.reset_time, 61_000);
        assert_eq!(record.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_record_expires_at_reset_time() {
        let record = CounterRecord::open(0, Duration::from_secs(1));
        assert!(!record.is_expired(999));
        assert!(record.is_expired(1_000));
    }

    #[test]
    fn test_admission_within_limit() {
        let record = CounterRecord {
            count: 3,
            window_start: 0,
            reset_time: 60_000,
        };
        let result = AdmissionResult::from_record(&record, 5, 10_000);
        assert!(result.allowed);
        assert_eq!(result.remaining, Some(2));
        assert_eq!(result.retry_after, None);
        assert_eq!(result.window_start, Some(0));
    }

    #[test]
    fn test_admission_over_limit_rounds_retry_up() {
        let record = CounterRecord {
            count: 6,
            window_start: 0,
            reset_time: 60_000,
        };
        let result = AdmissionResult::from_record(&record, 5, 10_001);
        assert!(!result.allowed);
        assert_eq!(result.remaining, Some(0));
        assert_eq!(result.retry_after, Some(50));
    }

    #[test]
    fn test_reset_time_secs() {
        let result = AdmissionResult::unlimited(None, 1_500);
        assert_eq!(result.reset_time_secs(), 2);
        assert_eq!(result.window_start, None);
    }
}
