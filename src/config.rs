//! Scheduler configuration.
//!
//! All tunables are plain data with serde support so callers can load them
//! from a config file or build them in code; nothing here is hard-coded
//! into the scheduler itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limiter::RateLimitPolicy;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-call timeout (30 seconds).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Retry tunables, convertible into a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts including the initial one.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1_000,
            max_delay_ms: 32_000,
        }
    }
}

impl RetryConfig {
    /// Builds the retry policy described by this config.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Fallback rate limit for sources that declare none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls admitted per window.
    pub max_calls: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let policy = RateLimitPolicy::default();
        Self {
            max_calls: policy.max_calls,
            window_ms: u64::try_from(policy.window.as_millis()).unwrap_or(1_000),
        }
    }
}

impl RateLimitConfig {
    /// Builds the rate-limit policy described by this config.
    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.max_calls, Duration::from_millis(self.window_ms))
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size, independent of the number of sources.
    pub workers: usize,
    /// Per source-call deadline in milliseconds; a timed-out call is
    /// classified as a transient network failure.
    pub request_timeout_ms: u64,
    /// Fallback rate limit for sources without a declared policy.
    pub default_rate_limit: RateLimitConfig,
    /// Retry behavior.
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            default_rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Returns the per-call timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
