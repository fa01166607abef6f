//! Retry Policy: an exponential-backoff state machine keyed on a
//! process-local consecutive-failure counter. Not persisted — resetting
//! on Supervisor restart is safe because backoff is a mitigation, not a
//! correctness condition.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff over a per-session consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    consecutive_failures: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(3600), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            consecutive_failures: 0,
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// `min(base * multiplier^consecutive_failures, max)`.
    pub fn next_delay(&self) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(self.consecutive_failures as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Subordinate convenience wrapper: run `f`, retrying up to
    /// `max_attempts` times on `Ok(false)` or `Err`, sleeping `next_delay()`
    /// between attempts. The Supervisor's own main loop does not use this —
    /// it drives the primitives directly so it can interleave session-state
    /// checks between iterations — but it's available for subordinate retry
    /// needs such as a flaky signal delivery.
    pub async fn with_retry<F, Fut, E>(&mut self, max_attempts: u32, mut f: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        for attempt in 0..max_attempts {
            match f().await {
                Ok(true) => {
                    self.record_success();
                    return Ok(());
                }
                Ok(false) => {
                    self.record_failure();
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.next_delay()).await;
                    }
                }
                Err(e) => {
                    self.record_failure();
                    if attempt + 1 >= max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.next_delay()).await;
                }
            }
        }
        Ok(())
    }
}
