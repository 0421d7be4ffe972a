//! Bounded retry with per-attempt timeout and exponential backoff.
//!
//! Every remote call made through the retrying client goes through
//! [`execute_with_retry`]. The attempt counter is a local of that function, so
//! concurrent calls sharing one policy and one client never see each other's
//! attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Raised when a single attempt does not settle within the policy's timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {}ms", .timeout.as_millis())]
pub struct AttemptTimeout {
    timeout: Duration,
}

impl AttemptTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Immutable retry settings. Holds no per-call state and can be shared by any
/// number of in-flight calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            attempt_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl RetryPolicy {
    /// `max_retries` is the total number of attempts and is clamped to at least 1.
    pub fn new(max_retries: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            attempt_timeout,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

/// Delay slept after the failed attempt at `attempt_index` (0-based):
/// `base_delay * 2^attempt_index`, saturating.
pub fn backoff_delay(policy: &RetryPolicy, attempt_index: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
    policy.base_delay.saturating_mul(factor)
}

/// Runs `operation` until it succeeds or `policy.max_retries()` attempts have
/// failed, racing each attempt against `policy.attempt_timeout()`.
///
/// On exhaustion the error of the final attempt is returned as-is. A timed-out
/// attempt is abandoned by dropping its future; whatever it already sent to the
/// remote side is not undone, so callers should only retry operations that are
/// safe to repeat.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<AttemptTimeout> + Display,
{
    let mut attempt: u32 = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(E::from(AttemptTimeout::new(policy.attempt_timeout))),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        attempt += 1;
        warn!(
            context,
            attempt,
            max_retries = policy.max_retries,
            error = %err,
            timestamp = %Utc::now().to_rfc3339(),
            "{context} - attempt {attempt} failed"
        );

        if attempt >= policy.max_retries {
            error!(
                context,
                max_retries = policy.max_retries,
                error = %err,
                timestamp = %Utc::now().to_rfc3339(),
                "{context} - max retries reached"
            );
            return Err(err);
        }

        tokio::time::sleep(backoff_delay(policy, attempt - 1)).await;
    }
}
