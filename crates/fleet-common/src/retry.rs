//! Retry and backoff helpers
//!
//! Two shapes of retry live here:
//!
//! - [`retry_with_backoff`] retries an async call in place with jittered
//!   exponential delays. It is for startup paths (CRD installation, the first
//!   API client) where there is no controller queue to fall back on.
//! - [`KeyedBackoff`] only computes delays. Error policies use it to requeue a
//!   failing resource key later and later, and reconcilers reset it once the
//!   key succeeds again.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Configuration for in-place retries
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry at most `attempts` times
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// attempt budget is spent
///
/// `is_retryable` decides whether an error is worth another attempt; a
/// non-retryable error is returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let exhausted = config.max_attempts > 0 && attempt >= config.max_attempts;
        if exhausted || !is_retryable(&e) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed, giving up"
            );
            return Err(e);
        }

        let sleep_for = jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = sleep_for.as_millis() as u64,
            "Operation failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;

        delay = grow(delay, config.backoff_multiplier, config.max_delay);
    }
}

/// Per-key exponential backoff for controller error policies
///
/// The first failure of a key waits `initial`, every further consecutive
/// failure multiplies the wait by `multiplier` up to `max`.
///
/// A key that has not failed for twice `max` was either retried successfully
/// or deleted, so its history is dropped on the next recorded failure.
#[derive(Debug)]
pub struct KeyedBackoff {
    failures: DashMap<String, (u32, Instant)>,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for KeyedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300), 2.0)
    }
}

impl KeyedBackoff {
    /// Create a backoff with explicit bounds
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            failures: DashMap::new(),
            initial,
            max,
            multiplier,
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying it
    pub fn next_delay(&self, key: &str) -> Duration {
        let stale_after = self.max.saturating_mul(2);
        self.failures
            .retain(|_, (_, last)| last.elapsed() < stale_after);

        let now = Instant::now();
        let mut entry = self.failures.entry(key.to_string()).or_insert((0, now));
        let exponent = entry.0;
        *entry = (exponent.saturating_add(1), now);

        let factor = self.multiplier.powi(exponent.min(32) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Forget the failure history of `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| f.0).unwrap_or(0)
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn grow(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::from_secs_f64((delay.as_secs_f64() * multiplier).min(max.as_secs_f64()))
}
