//! The source capability surface: one uniform interface per novel source.
//!
//! Every external source (scraper, API client, mirror) is reached only
//! through the [`SourceGateway`] trait. Sources register into a
//! [`SourceRegistry`] keyed by source id; the scheduler never knows which
//! concrete implementation it is talking to.
//!
//! Errors crossing this boundary are always a [`FetchError`] carrying a
//! shared [`ErrorKind`](crate::ErrorKind) - never a source-specific error
//! type. Long-running fetches receive a [`CancelToken`] and are expected
//! to observe it between network reads.

mod registry;

pub use registry::SourceRegistry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::rate_limiter::RateLimitPolicy;
use crate::storage::{ChapterContent, NovelMeta};

/// Cooperative cancellation signal for in-flight fetches.
///
/// Cancelling never hard-kills a call: the fetch observes the token at its
/// next checkpoint and returns, so partially transferred content is never
/// handed to storage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Error returned by every gateway operation.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    /// Shared failure classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Source-mandated delay before the next call, when the source
    /// provided one alongside a rate-limit rejection.
    pub retry_after: Option<Duration>,
}

impl FetchError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a transient network error.
    pub fn network_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkTransient, message)
    }

    /// Creates a rate-limit rejection, optionally carrying the source's
    /// requested delay.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimitExceeded,
            message: "source rejected the call due to rate limiting".to_string(),
            retry_after,
        }
    }

    /// Creates an authentication failure.
    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationFailure, message)
    }

    /// Creates a not-found error for content removed upstream.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotFound, message)
    }

    /// Creates a parsing failure.
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParsingFailure, message)
    }
}

/// Static description a source declares about itself at registration.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Stable identifier, the registry key (e.g. `"royalroad"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Declared call budget for this source.
    pub rate_limit: RateLimitPolicy,
    /// Maximum concurrent in-flight calls this source tolerates.
    pub max_concurrent: usize,
}

impl SourceDescriptor {
    /// Creates a descriptor with the given id and name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rate_limit: RateLimitPolicy::default(),
            max_concurrent: 1,
        }
    }

    /// Sets the declared rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    /// Sets the concurrent in-flight budget (clamped to at least 1).
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }
}

/// Uniform capability surface over one external source.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Arc<dyn SourceGateway>`. Rust 2024 native async traits are not
/// object-safe, so `async_trait` is required for the registry pattern.
///
/// # Contract
///
/// - Every error is a [`FetchError`]; implementations map their internal
///   failures (HTTP status, parse errors, session expiry) onto the shared
///   kinds before returning.
/// - Implementations should check `cancel` between network reads and
///   return early when it fires; the returned error is discarded, so any
///   `FetchError` kind is acceptable for a cancelled call.
#[async_trait]
pub trait SourceGateway: Send + Sync {
    /// Returns the source's static self-description.
    fn descriptor(&self) -> &SourceDescriptor;

    /// Fetches a novel's metadata.
    async fn fetch_novel_meta(
        &self,
        novel_id: &str,
        cancel: &CancelToken,
    ) -> Result<NovelMeta, FetchError>;

    /// Fetches the full, ordered chapter id list for a novel.
    async fn fetch_chapter_list(
        &self,
        novel_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, FetchError>;

    /// Fetches one chapter's content.
    async fn fetch_chapter_content(
        &self,
        novel_id: &str,
        chapter_id: &str,
        cancel: &CancelToken,
    ) -> Result<ChapterContent, FetchError>;
}
