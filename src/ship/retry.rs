//! Retry policy for outbound shipments.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with exponential backoff.
///
/// Attempt `n` (1-based) that fails waits `initial_backoff * 2^(n-1)`, capped
/// at `max_backoff`, before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    /// Default: 50ms
    pub initial_backoff: Duration,

    /// Upper bound for a single delay.
    /// Default: 1s
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt count and initial backoff.
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), initial_backoff, ..Default::default() }
    }

    /// A policy that never waits, for tests and in-process chains.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. On exhaustion the number of
    /// attempts made and the last error are returned.
    pub fn run<T, E, F>(&self, mut op: F) -> std::result::Result<T, (u32, E)>
    where
        F: FnMut(u32) -> std::result::Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err((attempt, e)),
                Err(_) => {
                    let delay = self.backoff(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
