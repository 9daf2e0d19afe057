//! Task types and lifecycle state definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::ErrorKind;

/// Priority for user-initiated work (lower sorts sooner).
pub const PRIORITY_USER: i64 = 0;

/// Priority for background library-update downloads.
pub const PRIORITY_BACKGROUND: i64 = 10;

/// The kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch novel metadata (title, author, summary).
    FetchNovelMeta,
    /// Fetch the chapter id list for a novel.
    FetchChapterList,
    /// Fetch one chapter's content and persist it.
    DownloadChapter,
    /// Check one library novel for new chapters.
    CheckLibraryUpdate,
}

impl TaskKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchNovelMeta => "fetch_novel_meta",
            Self::FetchChapterList => "fetch_chapter_list",
            Self::DownloadChapter => "download_chapter",
            Self::CheckLibraryUpdate => "check_library_update",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch_novel_meta" => Ok(Self::FetchNovelMeta),
            "fetch_chapter_list" => Ok(Self::FetchChapterList),
            "download_chapter" => Ok(Self::DownloadChapter),
            "check_library_update" => Ok(Self::CheckLibraryUpdate),
            _ => Err(format!("invalid task kind: {s}")),
        }
    }
}

/// Lifecycle state of a task.
///
/// States only advance forward: Queued → Running → {Succeeded, Retrying,
/// Failed, Cancelled}, and Retrying → Running once the backoff is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed; exactly one worker is executing it.
    Running,
    /// Failed an attempt; eligible again once `next_eligible_at` passes.
    Retrying,
    /// Finished successfully (content durably stored where applicable).
    Succeeded,
    /// Failed after retries were exhausted or the failure was fatal.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states a task can never leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task state: {s}")),
        }
    }
}

/// Specification for a task to be enqueued.
///
/// The natural key (kind, `source_id`, `novel_id`, `chapter_id`) makes
/// enqueue idempotent while an equivalent task is still live.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// The kind of work.
    pub kind: TaskKind,
    /// Which source the work targets.
    pub source_id: String,
    /// The novel the work targets.
    pub novel_id: String,
    /// The chapter the work targets (`DownloadChapter` only).
    pub chapter_id: Option<String>,
    /// Dispatch priority, lower = sooner.
    pub priority: i64,
}

impl TaskSpec {
    /// Spec for downloading one chapter at user priority.
    #[must_use]
    pub fn download_chapter(
        source_id: impl Into<String>,
        novel_id: impl Into<String>,
        chapter_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: TaskKind::DownloadChapter,
            source_id: source_id.into(),
            novel_id: novel_id.into(),
            chapter_id: Some(chapter_id.into()),
            priority: PRIORITY_USER,
        }
    }

    /// Spec for fetching a novel's metadata.
    #[must_use]
    pub fn fetch_novel_meta(source_id: impl Into<String>, novel_id: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::FetchNovelMeta,
            source_id: source_id.into(),
            novel_id: novel_id.into(),
            chapter_id: None,
            priority: PRIORITY_USER,
        }
    }

    /// Spec for fetching a novel's chapter list.
    #[must_use]
    pub fn fetch_chapter_list(source_id: impl Into<String>, novel_id: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::FetchChapterList,
            source_id: source_id.into(),
            novel_id: novel_id.into(),
            chapter_id: None,
            priority: PRIORITY_USER,
        }
    }

    /// Spec for checking one library novel for new chapters.
    #[must_use]
    pub fn check_library_update(
        source_id: impl Into<String>,
        novel_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: TaskKind::CheckLibraryUpdate,
            source_id: source_id.into(),
            novel_id: novel_id.into(),
            chapter_id: None,
            priority: PRIORITY_BACKGROUND,
        }
    }

    /// Returns a copy of this spec with a different priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of one execution attempt, reported back to the queue.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The attempt succeeded; any produced content is durably stored.
    Success,
    /// The attempt failed in a way the retry policy may recover from.
    RetryableFailure {
        /// Classified failure kind.
        kind: ErrorKind,
        /// Human-readable failure detail.
        message: String,
        /// Source-mandated delay before the next attempt, if provided.
        retry_after: Option<Duration>,
    },
    /// The attempt failed in a way no retry can recover from.
    FatalFailure {
        /// Classified failure kind.
        kind: ErrorKind,
        /// Human-readable failure detail.
        message: String,
    },
    /// The attempt observed a cancellation signal and stopped.
    Cancelled,
}

/// One row in the durable task queue.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    /// Unique identifier.
    pub id: i64,
    /// Kind of work (stored as text, parsed via `kind()`).
    #[sqlx(rename = "kind")]
    pub kind_str: String,
    /// Which source the work targets.
    pub source_id: String,
    /// The novel the work targets.
    pub novel_id: String,
    /// The chapter the work targets, when applicable.
    pub chapter_id: Option<String>,
    /// Current lifecycle state (stored as text, parsed via `state()`).
    #[sqlx(rename = "state")]
    pub state_str: String,
    /// Number of attempts already made.
    pub attempt: i64,
    /// Dispatch priority, lower = sooner.
    pub priority: i64,
    /// When the task was enqueued (unix millis).
    pub enqueued_at: i64,
    /// Earliest dispatch time for a retrying task (unix millis).
    pub next_eligible_at: i64,
    /// Kind of the most recent failure, if any.
    pub last_error_kind: Option<String>,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
    /// Owning batch, when the task was enqueued as part of one.
    pub batch_id: Option<i64>,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

impl Task {
    /// Returns the parsed kind enum.
    ///
    /// Falls back to `DownloadChapter` if the stored string is invalid.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind_str.parse().unwrap_or(TaskKind::DownloadChapter)
    }

    /// Returns the parsed state enum.
    ///
    /// Falls back to `Queued` if the stored string is invalid.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state_str.parse().unwrap_or(TaskState::Queued)
    }

    /// Returns the parsed last error kind, if one is recorded.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.last_error_kind.as_deref().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, kind: {}, source: {}, novel: {}, state: {} }}",
            self.id,
            self.kind(),
            self.source_id,
            self.novel_id,
            self.state()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_task(kind: &str, state: &str) -> Task {
        Task {
            id: 7,
            kind_str: kind.to_string(),
            source_id: "src-a".to_string(),
            novel_id: "novel-1".to_string(),
            chapter_id: Some("ch-3".to_string()),
            state_str: state.to_string(),
            attempt: 0,
            priority: PRIORITY_USER,
            enqueued_at: 0,
            next_eligible_at: 0,
            last_error_kind: None,
            last_error: None,
            batch_id: None,
            created_at: "2026-01-01".to_string(),
            updated_at: "2026-01-01".to_string(),
        }
    }

    #[test]
    fn test_task_kind_round_trip() {
        for kind in [
            TaskKind::FetchNovelMeta,
            TaskKind::FetchChapterList,
            TaskKind::DownloadChapter,
            TaskKind::CheckLibraryUpdate,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_task_state_round_trip() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::Retrying,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
    }

    #[test]
    fn test_task_state_terminality() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Retrying.is_terminal());
    }

    #[test]
    fn test_task_parses_stored_strings() {
        let task = sample_task("download_chapter", "retrying");
        assert_eq!(task.kind(), TaskKind::DownloadChapter);
        assert_eq!(task.state(), TaskState::Retrying);
    }

    #[test]
    fn test_task_state_fallback_on_invalid() {
        let task = sample_task("download_chapter", "garbage");
        assert_eq!(task.state(), TaskState::Queued);
    }

    #[test]
    fn test_task_error_kind_parses() {
        let mut task = sample_task("download_chapter", "failed");
        task.last_error_kind = Some("resource_not_found".to_string());
        assert_eq!(task.error_kind(), Some(ErrorKind::ResourceNotFound));
    }

    #[test]
    fn test_spec_constructors_set_natural_key() {
        let spec = TaskSpec::download_chapter("src-a", "novel-1", "ch-9");
        assert_eq!(spec.kind, TaskKind::DownloadChapter);
        assert_eq!(spec.chapter_id.as_deref(), Some("ch-9"));
        assert_eq!(spec.priority, PRIORITY_USER);

        let spec = TaskSpec::check_library_update("src-a", "novel-1");
        assert_eq!(spec.kind, TaskKind::CheckLibraryUpdate);
        assert!(spec.chapter_id.is_none());
        assert_eq!(spec.priority, PRIORITY_BACKGROUND);
    }

    #[test]
    fn test_spec_with_priority() {
        let spec = TaskSpec::fetch_novel_meta("src-a", "novel-1").with_priority(42);
        assert_eq!(spec.priority, 42);
    }

    #[test]
    fn test_task_display() {
        let task = sample_task("check_library_update", "running");
        let display = task.to_string();
        assert!(display.contains("7"));
        assert!(display.contains("check_library_update"));
        assert!(display.contains("running"));
    }
}
