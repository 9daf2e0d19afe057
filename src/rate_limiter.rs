//! Per-source rate limiting for outbound source calls.
//!
//! This module provides the [`RateLimiter`], the single admission point
//! consulted before every call to a source. Each source declares its own
//! [`RateLimitPolicy`] (N calls per window); sources that never declared
//! one fall back to a configured default.
//!
//! Unlike a wait primitive, [`RateLimiter::try_acquire`] never blocks: a
//! denied worker moves on to another source instead of stalling, and can
//! use [`RateLimiter::next_ready_in`] as a parking hint when every source
//! is exhausted.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use novelsync_core::{RateLimiter, RateLimitPolicy};
//!
//! let limiter = RateLimiter::new(RateLimitPolicy::default());
//! limiter.register("royalroad", RateLimitPolicy::new(2, Duration::from_secs(1)));
//!
//! assert!(limiter.try_acquire("royalroad"));
//! assert!(limiter.try_acquire("royalroad"));
//! // Window exhausted: denied without side effect.
//! assert!(!limiter.try_acquire("royalroad"));
//! ```

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// A source's declared call budget: `max_calls` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Calls admitted per window.
    pub max_calls: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Creates a new policy of `max_calls` per `window`.
    ///
    /// `max_calls` is clamped to at least 1.
    #[must_use]
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
        }
    }
}

impl Default for RateLimitPolicy {
    /// A conservative default for sources that declare nothing:
    /// 4 calls per second.
    fn default() -> Self {
        Self {
            max_calls: 4,
            window: Duration::from_secs(1),
        }
    }
}

/// Per-source window accounting.
#[derive(Debug)]
struct SourceWindow {
    policy: RateLimitPolicy,
    window_start: Instant,
    calls_in_window: u32,
    /// Server-mandated block (from a retry-after), honored before the
    /// normal window accounting.
    blocked_until: Option<Instant>,
}

impl SourceWindow {
    fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            window_start: Instant::now(),
            // A fresh window has spent nothing.
            calls_in_window: 0,
            blocked_until: None,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.policy.window {
            self.window_start = now;
            self.calls_in_window = 0;
        }
    }
}

/// Non-blocking per-source call admission.
///
/// Designed to be shared across worker tasks; uses `DashMap` for
/// lock-free concurrent access to per-source state. No lock is held
/// across an await point because no method awaits.
#[derive(Debug)]
pub struct RateLimiter {
    /// Policy applied to sources that never registered one.
    default_policy: RateLimitPolicy,

    /// Per-source window state.
    sources: DashMap<String, SourceWindow>,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given fallback policy.
    #[must_use]
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            default_policy,
            sources: DashMap::new(),
        }
    }

    /// Registers a source's declared policy.
    ///
    /// Replaces any existing accounting for the source.
    #[instrument(skip(self), fields(source = %source_id, max_calls = policy.max_calls, window_ms = policy.window.as_millis()))]
    pub fn register(&self, source_id: &str, policy: RateLimitPolicy) {
        self.sources
            .insert(source_id.to_string(), SourceWindow::new(policy));
    }

    /// Attempts to admit one call to the source.
    ///
    /// Returns true and consumes one window slot if capacity remains;
    /// returns false with no side effect when the window is exhausted or a
    /// server-mandated block is active. Never blocks the caller.
    #[must_use]
    pub fn try_acquire(&self, source_id: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceWindow::new(self.default_policy));

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return false;
            }
            entry.blocked_until = None;
        }

        entry.roll_window(now);

        if entry.calls_in_window < entry.policy.max_calls {
            entry.calls_in_window += 1;
            true
        } else {
            false
        }
    }

    /// Records a source-mandated delay (e.g. from a retry-after), blocking
    /// all admissions to the source until it elapses.
    #[instrument(skip(self), fields(source = %source_id, delay_ms = delay.as_millis()))]
    pub fn record_retry_after(&self, source_id: &str, delay: Duration) {
        let until = Instant::now() + delay;
        let mut entry = self
            .sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceWindow::new(self.default_policy));

        // Keep the later of an existing block and the new one.
        entry.blocked_until = Some(match entry.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        debug!(source = %source_id, "recorded source-mandated rate limit");
    }

    /// Returns how long until the source can admit a call, or `None` if it
    /// could admit one right now. Used by workers as a parking hint.
    #[must_use]
    pub fn next_ready_in(&self, source_id: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.sources.get(source_id)?;

        let mut wait = Duration::ZERO;
        if let Some(blocked_until) = entry.blocked_until {
            if blocked_until > now {
                wait = blocked_until.duration_since(now);
            }
        }

        let window_end = entry.window_start + entry.policy.window;
        if entry.calls_in_window >= entry.policy.max_calls && window_end > now {
            wait = wait.max(window_end.duration_since(now));
        }

        if wait.is_zero() { None } else { Some(wait) }
    }
}
