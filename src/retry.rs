//! Retry policy shared by the source client and the sink dispatcher
//!
//! Exponential backoff with a cap, bounded attempts, and jitter. A
//! `Retry-After` hint from the upstream replaces the computed delay.
//!
//! ```rust,ignore
//! use sap_audit_beat::RetryPolicy;
//!
//! let policy = RetryPolicy::default(); // 5 attempts, 2s base, 60s max
//! ```

use crate::error::{BeatError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Upper bound accepted for a `Retry-After` header
const MAX_RETRY_AFTER_SECS: f64 = 300.0;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Cap for the exponential growth, in milliseconds
    pub max_delay_ms: u64,
    /// Fraction of the delay that is randomized (0.0 = none, 1.0 = full jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Check the policy for nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BeatError::Config(
                "retry.maxAttempts must be >= 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(BeatError::Config(
                "retry.maxDelayMs must be >= retry.baseDelayMs".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(BeatError::Config(
                "retry.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Un-jittered delay after the given failed attempt (0-indexed)
    ///
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }

    /// Delay after the given failed attempt, with jitter applied
    ///
    /// Jitter only ever shortens the delay, so the cap is never exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as u64;
        let spread = (nominal as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            return Duration::from_millis(nominal);
        }
        let offset = rand::thread_rng().gen_range(0..=spread);
        Duration::from_millis(nominal - offset)
    }

    /// Parse a `Retry-After` header value in seconds
    ///
    /// Returns `None` for missing, unparseable, non-positive, or
    /// unreasonably large values.
    pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
        let value = header_value?.trim();
        let seconds = value.parse::<f64>().ok()?;
        if seconds > 0.0 && seconds <= MAX_RETRY_AFTER_SECS {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the
    /// attempt budget is spent
    ///
    /// Only errors for which [`BeatError::is_transient`] holds are retried.
    /// Exhausting the budget yields [`BeatError::RetriesExhausted`].
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, RetryableError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = None;

        for attempt in 0..attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(RetryableError { error, retry_after }) => {
                    if !error.is_transient() {
                        return Err(error);
                    }
                    if attempt + 1 < attempts {
                        let delay = retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt));
                        tracing::warn!(
                            operation,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last = Some(error);
                }
            }
        }

        Err(BeatError::RetriesExhausted {
            operation: operation.to_string(),
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

/// Failure of a single attempt, optionally carrying a server-provided delay
#[derive(Debug)]
pub struct RetryableError {
    pub error: BeatError,
    pub retry_after: Option<Duration>,
}

impl RetryableError {
    pub fn with_retry_after(error: BeatError, retry_after: Option<Duration>) -> Self {
        Self { error, retry_after }
    }
}

impl From<BeatError> for RetryableError {
    fn from(error: BeatError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}
