//! Error classification and bounded retry.
//!
//! External failures are either transient (retry with backoff) or fatal
//! (rethrow immediately). Classification is substring-based on the error
//! message, with structured status codes taking precedence when the error
//! type carries them. Unknown errors are treated as transient: an extra
//! retry is cheap, a false fatal kills the run.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry classification for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Fatal,
}

/// Classify an HTTP-ish status code, when one is known.
pub fn classify_status(code: u16) -> Option<RetryClass> {
    match code {
        429 => Some(RetryClass::Transient),
        500..=599 => Some(RetryClass::Transient),
        401 | 403 => Some(RetryClass::Fatal),
        _ => None,
    }
}

const FATAL_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication",
    "unauthorized",
    "401",
    "403",
    "permission denied",
    "not found",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "overloaded",
    "timeout",
    "timed out",
    "connection",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Classify an error by its message.
pub fn classify_message(message: &str) -> RetryClass {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return RetryClass::Fatal;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return RetryClass::Transient;
    }
    RetryClass::Transient
}

/// Classify any displayable error by its rendered message.
pub fn classify<E: std::fmt::Display>(error: &E) -> RetryClass {
    classify_message(&error.to_string())
}

/// Why a retried operation ultimately failed.
#[derive(Debug, Error)]
pub enum RetryFailure<E: std::fmt::Display + std::fmt::Debug> {
    /// A fatal error; the operation was not retried after it.
    #[error("fatal error: {0}")]
    Fatal(E),
    /// Every attempt failed with a transient error.
    #[error("max retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &cadence_core::RunConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Sleep before attempt `next_attempt` (2-based: no sleep precedes the
    /// first attempt): `min(base * 2^(n-1), max)` with multiplicative
    /// jitter in `[0.5, 1.5)`.
    pub fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let exp = completed_attempts.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(jitter)
    }

    /// Run `op` with retry, synchronously.
    pub fn execute<T, E, F>(
        &self,
        classify: impl Fn(&E) -> RetryClass,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if classify(&error) == RetryClass::Fatal {
                        warn!(attempt, error = %error, "fatal error, not retrying");
                        return Err(RetryFailure::Fatal(error));
                    }
                    if attempt >= self.max_attempts {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error,
                        "transient error, backing off");
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Run an async `op` with retry. The closure produces a fresh future
    /// per attempt.
    pub async fn execute_async<T, E, F, Fut>(
        &self,
        classify: impl Fn(&E) -> RetryClass,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if classify(&error) == RetryClass::Fatal {
                        warn!(attempt, error = %error, "fatal error, not retrying");
                        return Err(RetryFailure::Fatal(error));
                    }
                    if attempt >= self.max_attempts {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error,
                        "transient error, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
