//! Exponential backoff with jitter.
//!
//! Shared by the connection supervisor (unbounded reconnects), the outbound
//! queue (bounded per-message retries) and direct-channel lookups.
//!
//! Jitter uses `std::time::SystemTime` UNIX nanos as a seed to avoid
//! requiring the `rand` crate as a dependency.

use mattergate_types::config::DeliveryConfig;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    ///
    /// The actual sleep is `delay * (1 - random_fraction * jitter)`, where
    /// `random_fraction` is in `[0, 1)`. Jitter only shortens the delay, so
    /// it still spreads callers that have reached the cap.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Per-message retry schedule from the delivery settings.
    pub fn delivery(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_max_ms,
            jitter: config.backoff_jitter,
        }
    }

    /// Reconnect schedule: same delays, attempts unbounded.
    pub fn reconnect(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: u32::MAX,
            ..Self::delivery(config)
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, attempt))
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// The last attempt failed, either because attempts ran out or because
    /// the error was not retryable.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

/// Stateful backoff counter for loops that retry forever.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Compute the delay for a given attempt (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 - random * jitter)`
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    // Exponential base: min_delay * 2^attempt, capped at max_delay.
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return capped;
    }

    jittered(capped, pseudo_random_fraction(), config.jitter)
}

/// Scale `capped` down by up to `jitter` of itself.
fn jittered(capped: u64, frac: f64, jitter: f64) -> u64 {
    let factor = 1.0 - frac * jitter.min(1.0);
    ((capped as f64) * factor) as u64
}

/// Return a pseudo-random fraction in `[0, 1)` using the current system time
/// nanos. This is NOT cryptographically secure, but good enough for jitter.
fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761); // Knuth multiplicative hash
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Execute an async operation with retry.
///
/// - `operation` is called once per attempt.
/// - `should_retry` decides whether an error is worth another attempt.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded after {} failures", attempt - 1);
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(attempt, "error is not retryable, giving up: {:?}", err);
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }
        if attempt >= max {
            warn!(
                attempt,
                max_attempts = max,
                "all retry attempts exhausted: {:?}",
                err
            );
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay_ms = compute_backoff(config, attempt - 1);
        debug!(attempt, delay_ms, "retrying after error: {:?}", err);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
