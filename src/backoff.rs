//! Retry backoff policy.
//!
//! One centralized exponential-backoff computation with jitter, configured
//! once instead of duplicated ad-hoc per API client. The jitter spreads
//! retries out so a burst of failures does not produce a synchronized retry
//! storm.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with cap and jitter.
///
/// `delay(attempt) = min(cap, base * 2^attempt) + jitter`, where jitter is
/// uniform in `[0, delay / 5]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for attempt 0.
    pub base: Duration,
    /// Upper bound on the exponential term.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy from configured millisecond values.
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
        }
    }

    /// Delay before the next retry, given the number of attempts so far.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.raw_delay(attempt);
        let jitter_cap = exp.as_millis() as u64 / 5;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_cap)
        };
        exp + Duration::from_millis(jitter)
    }

    /// The capped exponential term without jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 2u64.checked_pow(attempt.min(63)).unwrap_or(u64::MAX);
        let exp_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(exp_ms.min(self.cap.as_millis() as u64))
    }
}
