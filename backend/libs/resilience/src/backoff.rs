//! Backoff policies
//!
//! [`FixedBackoff`] bounds how many times one failing unit of work is redelivered.
//! [`ExponentialBackoff`] plus [`ErrorStreak`] pace a loop that keeps hitting
//! infrastructure errors (broker disconnects, Redis outages).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed interval between retries, with a hard cap on the number of retries.
///
/// A unit of work gets one initial attempt plus `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
    pub max_retries: u32,
}

impl FixedBackoff {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    ///
    /// Returns `None` once the retry budget is spent.
    pub fn next_delay(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts > self.max_retries {
            return None;
        }
        Some(self.interval)
    }

    /// Total number of attempts (initial + retries)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Capped exponential backoff: `min * 2^(n-1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub min: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn delay_for(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors <= 1 {
            return self.min.min(self.max);
        }
        let factor = 2u32.saturating_pow(consecutive_errors - 1);
        self.min.saturating_mul(factor).min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Tracks consecutive errors of a long-running loop.
///
/// Shared between the loop and health checks, hence the atomics.
#[derive(Debug)]
pub struct ErrorStreak {
    consecutive: AtomicU32,
    last_success_ms: AtomicU64,
    backoff: ExponentialBackoff,
}

impl ErrorStreak {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_millis()),
            backoff,
        }
    }

    /// Record a successful operation, resetting the streak
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_millis(), Ordering::SeqCst);
    }

    /// Record an error and return the new streak length
    pub fn record_error(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Delay to apply after the current streak of errors
    pub fn current_backoff(&self) -> Duration {
        self.backoff.delay_for(self.consecutive_errors())
    }
}

impl Default for ErrorStreak {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
