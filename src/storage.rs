//! Storage collaborator interface.
//!
//! The persistent store for novels, chapters, and preferences is outside
//! this crate; the scheduler only depends on this contract. The one rule
//! that matters for correctness: a download task is marked succeeded only
//! after [`StorageBackend::save_chapter_content`] has durably returned,
//! so a crash mid-download can re-run the task without corrupting or
//! duplicating content.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error from the storage collaborator.
///
/// The scheduler treats storage failures as retryable: the fetch already
/// succeeded, so another attempt re-fetches and re-saves.
#[derive(Debug, Error)]
#[error("storage backend error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    /// Creates a storage error from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Novel metadata as fetched from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelMeta {
    /// Source-scoped novel identifier.
    pub novel_id: String,
    /// Title as reported by the source.
    pub title: String,
    /// Author, when the source exposes one.
    pub author: Option<String>,
    /// Synopsis, when the source exposes one.
    pub summary: Option<String>,
    /// Cover image URL, when the source exposes one.
    pub cover_url: Option<String>,
}

/// One chapter's fetched content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
    /// Source-scoped chapter identifier.
    pub chapter_id: String,
    /// Chapter title.
    pub title: String,
    /// Chapter body text.
    pub body: String,
}

/// A novel in the user's library, as enumerated for update checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryNovel {
    /// Which source the novel lives on.
    pub source_id: String,
    /// Source-scoped novel identifier.
    pub novel_id: String,
    /// Title for logs and progress reporting.
    pub title: String,
    /// Whether new chapters should be downloaded automatically or only
    /// recorded as available.
    pub auto_download: bool,
}

/// Contract to the external persistent store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Durably persists one chapter's content.
    ///
    /// Must only return `Ok` once the content would survive a process
    /// crash; the scheduler acknowledges the task as succeeded strictly
    /// after this returns.
    async fn save_chapter_content(
        &self,
        novel_id: &str,
        chapter_id: &str,
        content: &ChapterContent,
    ) -> Result<(), StorageError>;

    /// Persists refreshed novel metadata.
    async fn save_novel_meta(&self, meta: &NovelMeta) -> Result<(), StorageError>;

    /// Returns the chapter ids already known (downloaded or recorded) for
    /// a novel. Update checks diff the source's list against this set.
    async fn known_chapter_ids(&self, novel_id: &str) -> Result<HashSet<String>, StorageError>;

    /// Enumerates the user's library for a periodic update run.
    async fn library_novels(&self) -> Result<Vec<LibraryNovel>, StorageError>;
}
