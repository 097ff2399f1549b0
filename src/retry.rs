//! Bounded exponential retry for transient collaborator faults.
//!
//! The run id is passed explicitly on every call so retries are logged against
//! the execution that issued them; there is no shared policy state.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::telemetry;

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Backoff parameters; the n-th retry (1-based) waits `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retry ceiling, not counting the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// A policy that never waits, for tests and in-process calls.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..self.jitter_factor);
        delay.mul_f64(1.0 + jitter)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
        }
    }
}

/// Runs `call` until it succeeds, fails permanently, or the retry ceiling is
/// reached. The last error is returned once retries are exhausted.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    run_id: Uuid,
    operation: &'static str,
    mut call: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.backoff(retries);
                warn!(
                    run_id = %run_id,
                    part = ?telemetry::current_part(),
                    operation,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Got a transient fault. Retrying. This was try {} out of {}",
                    retries,
                    policy.max_retries
                );
                counter!("transient_retries_total", "operation" => operation).increment(1);
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
