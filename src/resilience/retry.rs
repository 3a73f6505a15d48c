//! Bounded retry with exponential backoff and symmetric jitter.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule for calls to external services.
///
/// `max_retries` counts retries, so an operation runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub multiplier: f64,
    pub jitter_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_secs: 2.0,
            multiplier: 2.0,
            jitter_secs: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits; used for fast retries and tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_secs: 0.0,
            multiplier: 1.0,
            jitter_secs: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based), before jitter
    pub fn base_delay_secs(&self, retry: u32) -> f64 {
        let exponent = retry.saturating_sub(1) as i32;
        self.initial_backoff_secs.max(0.0) * self.multiplier.max(1.0).powi(exponent)
    }

    /// Delay before retry number `retry` (1-based) with jitter drawn from `rng`
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_secs(retry);
        let jitter = if self.jitter_secs > 0.0 {
            rng.gen_range(-self.jitter_secs..=self.jitter_secs)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// The full delay schedule for one operation
    pub fn schedule<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Duration> {
        (1..=self.max_retries)
            .map(|retry| self.delay_for(retry, rng))
            .collect()
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only errors for which `is_transient` returns true are retried; the last
/// error is returned once attempts run out.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry_count = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry_count < policy.max_retries && is_transient(&e) => {
                retry_count += 1;
                let delay = policy.delay_for(retry_count, &mut rand::thread_rng());
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    retry_count,
                    policy.max_attempts(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
