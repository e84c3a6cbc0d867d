//! Retry policy for the collection boundary.
//!
//! The policy object is the redesigned form of the original's retry
//! decorator: explicit knobs, a retryable-error predicate, and no reach into
//! the statistical core. Detection code never retries; only collector calls
//! are wrapped.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::CollectorError;

/// Exponential backoff with optional jitter, bounded attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so `max_retries = 3` means up to
    /// four calls total.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiply each delay by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let factor: f64 = 0.5 + rand::thread_rng().gen::<f64>();
        delay.mul_f64(factor)
    }

    /// Run `op`, retrying transient collector failures with backoff.
    ///
    /// Access-denied errors are returned immediately; a run that cannot read
    /// its data source has nothing to retry toward. Exhausted retries return
    /// the last error.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, CollectorError>
    where
        F: FnMut() -> Result<T, CollectorError>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.jittered_delay(attempt);
                    info!(
                        "retrying {} after {:.2}s (attempt {}/{}): {}",
                        label,
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.max_retries + 1,
                        err
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!("max retries reached for {}: {}", label, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}
