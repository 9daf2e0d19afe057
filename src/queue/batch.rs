//! Batch grouping for user-initiated multi-task downloads.
//!
//! A batch is a label over member tasks; its aggregate result is always
//! derived from the members' states, never stored. Partial success is the
//! expected shape of a finished batch, not an error.

use serde::Serialize;
use sqlx::FromRow;

use crate::error::ErrorKind;

/// A user-facing grouping of tasks created by one action.
#[derive(Debug, Clone, FromRow)]
pub struct Batch {
    /// Unique identifier.
    pub id: i64,
    /// Human-readable label (e.g. the novel title).
    pub label: String,
    /// When the batch was created.
    pub created_at: String,
}

/// Result of enqueueing a batch of task specs.
///
/// Specs whose natural key already had a live task are skipped rather than
/// failing the whole batch.
#[derive(Debug, Clone)]
pub struct BatchEnqueueOutcome {
    /// The created batch id.
    pub batch_id: i64,
    /// Ids of the newly created member tasks.
    pub task_ids: Vec<i64>,
    /// Count of specs skipped because an equivalent live task existed.
    pub duplicates_skipped: usize,
}

/// An error preserved from one failed or cancelled member task.
#[derive(Debug, Clone, Serialize)]
pub struct BatchTaskError {
    /// The failed task's id.
    pub task_id: i64,
    /// The chapter the task targeted, when applicable.
    pub chapter_id: Option<String>,
    /// Classified failure kind, when recorded.
    pub kind: Option<ErrorKind>,
    /// Failure message, when recorded.
    pub message: Option<String>,
}

/// Aggregate view of a batch, derived from member task states.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// The batch id.
    pub batch_id: i64,
    /// Total member tasks.
    pub total: usize,
    /// Members that succeeded.
    pub succeeded: usize,
    /// Members that failed terminally.
    pub failed: usize,
    /// Members that were cancelled.
    pub cancelled: usize,
    /// Members still queued, running, or retrying.
    pub pending: usize,
    /// Errors preserved from failed members, by task id.
    pub errors: Vec<BatchTaskError>,
}

impl BatchReport {
    /// Returns true once every member task reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pending == 0
    }
}
