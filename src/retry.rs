//! Retry decisions with exponential backoff for failed source calls.
//!
//! [`RetryPolicy::decide`] is a pure function from (failure kind, attempts
//! made) to a [`RetryDecision`]. The queue consults it when an attempt
//! reports a retryable failure; the computed delay becomes the task's
//! backoff gate.
//!
//! # Policy
//!
//! | kind | behavior |
//! |---|---|
//! | `NetworkTransient` | exponential backoff up to `max_attempts` |
//! | `RateLimitExceeded` | retry; the caller substitutes a source retry-after when present |
//! | `AuthenticationFailure` | give up immediately |
//! | `ResourceNotFound` | give up immediately |
//! | `ParsingFailure` | one retry, then give up |
//! | `Unknown` | exponential backoff up to `max_attempts` |
//!
//! Exceeding `max_attempts` always gives up regardless of kind.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::ErrorKind;

/// Default maximum attempts (including the initial attempt).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Attempts allowed for parsing failures: the initial try plus one retry.
const PARSING_MAX_ATTEMPTS: u32 = 2;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision on whether a failed task attempt should be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before the task becomes eligible again.
        delay: Duration,
    },
    /// Do not retry.
    GiveUp {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Creates a policy with a custom `max_attempts`, defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `kind` - Classification of the failure
    /// * `attempt` - Number of attempts already made (1 after the first
    ///   failure)
    #[must_use]
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        match kind {
            ErrorKind::AuthenticationFailure => {
                return RetryDecision::GiveUp {
                    reason: "authentication required - retry without fresh credentials would not help"
                        .to_string(),
                };
            }
            ErrorKind::ResourceNotFound => {
                return RetryDecision::GiveUp {
                    reason: "content removed upstream - retry would not help".to_string(),
                };
            }
            ErrorKind::ParsingFailure => {
                if attempt >= PARSING_MAX_ATTEMPTS.min(self.max_attempts) {
                    return RetryDecision::GiveUp {
                        reason: "parsing failed again - markup change, not a glitch".to_string(),
                    };
                }
            }
            ErrorKind::NetworkTransient | ErrorKind::RateLimitExceeded | ErrorKind::Unknown => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.calculate_delay(attempt),
        }
    }

    /// Calculates the delay before the next attempt.
    ///
    /// Formula: `min(base_delay * 2^(attempt - 1), max_delay) + jitter`
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;

        // attempt 1 = first retry = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * 2f64.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Generates random jitter between 0 and `min(base_delay, MAX_JITTER)`.
    ///
    /// Jitter spreads out retries when many tasks fail simultaneously and
    /// would otherwise become eligible at the same instant. Scaling it to
    /// the base delay keeps short-backoff configurations short.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let ceiling = self.base_delay.min(MAX_JITTER);
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}
