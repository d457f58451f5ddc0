//! Retry backoff schedule for pending operations.
//!
//! Exponential backoff with random jitter to prevent thundering herd when
//! many queued sends retry after connectivity returns. Timers are logical:
//! the schedule computes deadlines from a caller-supplied clock reading, so
//! tests never need real wall-clock delays.

use std::time::Duration;

/// Retry schedule: exponential backoff, capped, with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling on the computed delay (before jitter).
    pub cap: Duration,
    /// Attempts after which an operation is permanently failed.
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetrySchedule {
    /// Maximum jitter added to each delay, in milliseconds.
    const JITTER_MS: u64 = 1_000;

    /// Delay before attempt number `attempt` (1-based).
    ///
    /// Formula: `min(cap, base * 2^(attempt-1)) + random(0..=1000ms)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);
        scaled + Duration::from_millis(random_jitter_ms())
    }

    /// Deadline for attempt number `attempt`, in unix milliseconds.
    pub fn next_retry_at(&self, now_millis: i64, attempt: u32) -> i64 {
        now_millis.saturating_add(self.delay_for(attempt).as_millis() as i64)
    }

    /// Whether `attempt` attempts have exhausted the schedule.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Generate random jitter between 0 and 1000 milliseconds.
///
/// Falls back to zero jitter if the OS entropy source is unavailable;
/// the schedule still works, retries just align more often.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % (RetrySchedule::JITTER_MS + 1)
}
