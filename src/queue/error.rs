//! Error types for queue operations.

use thiserror::Error;

/// Errors that can occur during task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An equivalent non-terminal task already exists.
    ///
    /// Enqueue is idempotent by natural key (kind, source, novel, chapter);
    /// callers should treat this as "already in progress", not a failure.
    #[error("a live task already exists for {kind} {source_id}/{novel_id}")]
    DuplicateTask {
        /// Kind of the duplicated task.
        kind: String,
        /// Source of the duplicated task.
        source_id: String,
        /// Novel of the duplicated task.
        novel_id: String,
    },

    /// No task exists with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// No batch exists with the given id.
    #[error("batch not found: {0}")]
    BatchNotFound(i64),

    /// The task is not in a state that permits the requested transition.
    #[error("task {id} is {state}, cannot {operation}")]
    InvalidTransition {
        /// Task id.
        id: i64,
        /// Current state string.
        state: String,
        /// The operation that was rejected.
        operation: &'static str,
    },

    /// Underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
