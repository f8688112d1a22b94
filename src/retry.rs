//! Bounded retry for downstream RPC calls.
//!
//! [`with_retry`] re-invokes a fallible async operation with exponential
//! backoff, limited to the policy's attempt budget. Only errors classified as
//! transient are retried; permanent failures surface immediately.
//!
//! Classification prefers typed errors from the HTTP client (timeouts,
//! connection failures, status codes). For opaque error strings from unknown
//! sources, [`classify_message`] falls back to substring matching.

use std::fmt::Display;
use std::time::Duration;

use crate::hooks::HookRegistry;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Worth retrying after backoff.
    Transient,
    /// The downstream did not answer in time. Retryable.
    Timeout,
    /// The downstream throttled us. Retryable.
    RateLimited,
    /// Retrying cannot help.
    Permanent,
}

impl RetryClass {
    pub fn retryable(self) -> bool {
        !matches!(self, RetryClass::Permanent)
    }
}

/// Retry budget and backoff curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt after `attempt` (1-based):
    /// `min(max_interval, initial_interval * multiplier^(attempt-1))`.
    pub fn backoff_interval(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.powi(exp as i32);
        let raw = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_interval.as_secs_f64()))
    }
}

/// Classify a typed HTTP client error.
pub fn classify_reqwest(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() {
        return RetryClass::Timeout;
    }
    if err.is_connect() {
        return RetryClass::Transient;
    }
    if let Some(status) = err.status() {
        if status.as_u16() == 429 {
            return RetryClass::RateLimited;
        }
        if status.is_server_error() {
            return RetryClass::Transient;
        }
        if status.is_client_error() {
            return RetryClass::Permanent;
        }
    }
    RetryClass::Transient
}

/// Substring fallback for error strings with no typed source.
pub fn classify_message(message: &str) -> RetryClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return RetryClass::Timeout;
    }
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return RetryClass::RateLimited;
    }
    if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("connection")
        || lower.contains("unavailable")
        || lower.contains("reset by peer")
    {
        return RetryClass::Transient;
    }
    RetryClass::Permanent
}

/// Invoke `operation` up to `policy.max_attempts` times.
///
/// Errors classified as `Permanent` are returned immediately; others sleep
/// the backoff interval and retry. Every retry emits an `rpc.retry`
/// observability event labeled with `service`.
pub async fn with_retry<T, E, F, Fut>(
    service: &str,
    policy: &RetryPolicy,
    hooks: &HookRegistry,
    classify: impl Fn(&E) -> RetryClass,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                if attempt >= policy.max_attempts.max(1) || !class.retryable() {
                    return Err(err);
                }
                hooks.rpc_retry(service, attempt, &err.to_string());
                tokio::time::sleep(policy.backoff_interval(attempt)).await;
                attempt += 1;
            }
        }
    }
}
