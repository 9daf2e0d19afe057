//! Durable task queue for download and library-update work.
//!
//! This module provides the `SQLite`-backed queue that owns the task
//! lifecycle (queued → running → succeeded/retrying/failed/cancelled).
//! Claiming is atomic (`UPDATE ... RETURNING`), so two workers can never
//! run the same task concurrently, and queued work survives process
//! restarts.
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`TaskQueue`] - Main interface for queue operations
//! - [`Task`] / [`TaskSpec`] - Individual work items and their natural key
//! - [`TaskState`] / [`TaskOutcome`] - Lifecycle states and attempt results
//! - [`Batch`] / [`BatchReport`] - User-facing grouping with derived results
//! - [`QueueError`] - Operation error types
//!
//! # Example
//!
//! ```ignore
//! use novelsync_core::{Database, RetryPolicy, TaskQueue, TaskSpec};
//!
//! let db = Database::new(Path::new("novelsync.db")).await?;
//! let queue = TaskQueue::new(db, RetryPolicy::default());
//!
//! let id = queue
//!     .enqueue(&TaskSpec::download_chapter("royalroad", "novel-1", "ch-12"))
//!     .await?;
//!
//! // Workers claim ready tasks per source:
//! for task in queue.dequeue_ready("royalroad", 4).await? {
//!     // ... execute the task ...
//! }
//! ```

mod batch;
mod error;
mod task;

pub use batch::{Batch, BatchEnqueueOutcome, BatchReport, BatchTaskError};
pub use error::QueueError;
pub use task::{
    PRIORITY_BACKGROUND, PRIORITY_USER, Task, TaskKind, TaskOutcome, TaskSpec, TaskState,
};

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::ErrorKind;
use crate::retry::{RetryDecision, RetryPolicy};

pub use error::Result;

/// Returns the current wall-clock time as unix milliseconds.
///
/// Backoff due-times are stored as absolute wall-clock instants so that a
/// restart does not reset pending retry delays.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Returns `Ok(())` if at least one row was affected; otherwise [`QueueError::TaskNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(QueueError::TaskNotFound(id))
    } else {
        Ok(())
    }
}

/// Queue manager for scheduler work items.
///
/// Provides atomic operations for managing task lifecycle, backed by
/// `SQLite` with WAL mode for concurrent access. Holds the [`RetryPolicy`]
/// so that reporting a retryable failure and scheduling the next attempt is
/// a single operation.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: Database,
    retry: RetryPolicy,
}

impl TaskQueue {
    /// Creates a new queue manager with the given database connection and
    /// retry policy.
    #[must_use]
    pub fn new(db: Database, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Returns the retry policy consulted on retryable failures.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Adds a new task to the queue in `Queued` state.
    ///
    /// Enqueue is idempotent by natural key: if a non-terminal task with the
    /// same (kind, source, novel, chapter) exists, this fails with
    /// [`QueueError::DuplicateTask`] instead of creating a second download
    /// of the same content. Terminal tasks never block re-enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateTask`] for a live equivalent task, or
    /// [`QueueError::Database`] if the insert fails.
    #[instrument(skip(self, spec), fields(kind = %spec.kind, source = %spec.source_id, novel = %spec.novel_id))]
    pub async fn enqueue(&self, spec: &TaskSpec) -> Result<i64> {
        self.insert_task(spec, None).await
    }

    /// Creates a batch and enqueues its member tasks.
    ///
    /// Specs whose natural key already has a live task are skipped and
    /// counted in the outcome; the remaining members are still created.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the batch insert or a member
    /// insert fails for a reason other than duplication.
    #[instrument(skip(self, specs), fields(label = %label, specs = specs.len()))]
    pub async fn enqueue_batch(
        &self,
        label: &str,
        specs: &[TaskSpec],
    ) -> Result<BatchEnqueueOutcome> {
        let row = sqlx::query(r"INSERT INTO batches (label) VALUES (?) RETURNING id")
            .bind(label)
            .fetch_one(self.db.pool())
            .await?;
        let batch_id: i64 = row.get("id");

        let mut task_ids = Vec::with_capacity(specs.len());
        let mut duplicates_skipped = 0;
        for spec in specs {
            match self.insert_task(spec, Some(batch_id)).await {
                Ok(id) => task_ids.push(id),
                Err(QueueError::DuplicateTask { .. }) => {
                    debug!(novel = %spec.novel_id, chapter = ?spec.chapter_id, "skipping duplicate batch member");
                    duplicates_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(BatchEnqueueOutcome {
            batch_id,
            task_ids,
            duplicates_skipped,
        })
    }

    async fn insert_task(&self, spec: &TaskSpec, batch_id: Option<i64>) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO tasks (
                kind,
                source_id,
                novel_id,
                chapter_id,
                state,
                priority,
                enqueued_at,
                batch_id
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(spec.kind.as_str())
        .bind(&spec.source_id)
        .bind(&spec.novel_id)
        .bind(spec.chapter_id.as_deref())
        .bind(TaskState::Queued.as_str())
        .bind(spec.priority)
        .bind(now_millis())
        .bind(batch_id)
        .fetch_one(self.db.pool())
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(QueueError::DuplicateTask {
                    kind: spec.kind.as_str().to_string(),
                    source_id: spec.source_id.clone(),
                    novel_id: spec.novel_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claims up to `limit` ready tasks for one source.
    ///
    /// Ready means `Queued`, or `Retrying` with its backoff due. Claimed
    /// tasks transition to `Running` as part of this call (claim-on-read),
    /// ordered by (priority ascending, enqueued time ascending).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self), fields(source = %source_id))]
    pub async fn dequeue_ready(&self, source_id: &str, limit: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE id IN (
                  SELECT id FROM tasks
                  WHERE source_id = ?
                    AND (state = ? OR (state = ? AND next_eligible_at <= ?))
                  ORDER BY priority ASC, enqueued_at ASC
                  LIMIT ?
              )
              RETURNING *",
        )
        .bind(TaskState::Running.as_str())
        .bind(source_id)
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Retrying.as_str())
        .bind(now_millis())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(tasks)
    }

    /// Atomically claims one specific task if it is ready.
    ///
    /// Used by the inline library-check path; returns `None` if the task is
    /// not currently claimable (running elsewhere, terminal, or backing
    /// off).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim(&self, task_id: i64) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE id = ?
                AND (state = ? OR (state = ? AND next_eligible_at <= ?))
              RETURNING *",
        )
        .bind(TaskState::Running.as_str())
        .bind(task_id)
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Retrying.as_str())
        .bind(now_millis())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(task)
    }

    /// Returns true if the source has at least one ready task.
    ///
    /// Cheap probe used by workers before spending a rate-limit token.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn has_ready(&self, source_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r"SELECT EXISTS (
                SELECT 1 FROM tasks
                WHERE source_id = ?
                  AND (state = ? OR (state = ? AND next_eligible_at <= ?))
              ) AS ready",
        )
        .bind(source_id)
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Retrying.as_str())
        .bind(now_millis())
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get::<i64, _>("ready") != 0)
    }

    /// Reports the outcome of one execution attempt for a `Running` task.
    ///
    /// - `Success` → `Succeeded`
    /// - `Cancelled` → `Cancelled`
    /// - `FatalFailure` → `Failed`
    /// - `RetryableFailure` → consults the retry policy: either `Retrying`
    ///   with `next_eligible_at = now + delay` and the attempt counter
    ///   advanced, or `Failed` when retries are exhausted. A source-provided
    ///   retry-after overrides the computed backoff for rate-limit errors.
    ///
    /// Returns the task's new state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TaskNotFound`] for an unknown id,
    /// [`QueueError::InvalidTransition`] if the task is not `Running`, or
    /// [`QueueError::Database`] if an update fails.
    #[instrument(skip(self, outcome), fields(task_id))]
    pub async fn complete(&self, task_id: i64, outcome: TaskOutcome) -> Result<TaskState> {
        match outcome {
            TaskOutcome::Success => {
                self.finish_running(task_id, TaskState::Succeeded, None, None)
                    .await?;
                Ok(TaskState::Succeeded)
            }
            TaskOutcome::Cancelled => {
                self.finish_running(task_id, TaskState::Cancelled, None, None)
                    .await?;
                Ok(TaskState::Cancelled)
            }
            TaskOutcome::FatalFailure { kind, message } => {
                self.finish_running(task_id, TaskState::Failed, Some(kind), Some(&message))
                    .await?;
                Ok(TaskState::Failed)
            }
            TaskOutcome::RetryableFailure {
                kind,
                message,
                retry_after,
            } => {
                let task = self
                    .get(task_id)
                    .await?
                    .ok_or(QueueError::TaskNotFound(task_id))?;
                if task.state() != TaskState::Running {
                    return Err(QueueError::InvalidTransition {
                        id: task_id,
                        state: task.state_str,
                        operation: "complete",
                    });
                }

                // This attempt counts; decide based on attempts made so far.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let attempts_done = (task.attempt + 1).max(1) as u32;

                match self.retry.decide(kind, attempts_done) {
                    RetryDecision::Retry { delay } => {
                        let delay = if kind == ErrorKind::RateLimitExceeded {
                            retry_after.unwrap_or(delay)
                        } else {
                            delay
                        };
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        let next_eligible_at = now_millis() + delay.as_millis() as i64;
                        let result = sqlx::query(
                            r"UPDATE tasks
                              SET state = ?,
                                  attempt = attempt + 1,
                                  next_eligible_at = ?,
                                  last_error_kind = ?,
                                  last_error = ?,
                                  updated_at = datetime('now')
                              WHERE id = ? AND state = ?",
                        )
                        .bind(TaskState::Retrying.as_str())
                        .bind(next_eligible_at)
                        .bind(kind.as_str())
                        .bind(&message)
                        .bind(task_id)
                        .bind(TaskState::Running.as_str())
                        .execute(self.db.pool())
                        .await?;
                        check_affected(task_id, result.rows_affected())?;
                        Ok(TaskState::Retrying)
                    }
                    RetryDecision::GiveUp { reason } => {
                        debug!(task_id, %reason, "retries exhausted");
                        self.finish_running(task_id, TaskState::Failed, Some(kind), Some(&message))
                            .await?;
                        Ok(TaskState::Failed)
                    }
                }
            }
        }
    }

    /// Moves a `Running` task to a terminal state, recording any error.
    async fn finish_running(
        &self,
        task_id: i64,
        state: TaskState,
        kind: Option<ErrorKind>,
        message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?,
                  attempt = attempt + 1,
                  last_error_kind = COALESCE(?, last_error_kind),
                  last_error = COALESCE(?, last_error),
                  updated_at = datetime('now')
              WHERE id = ? AND state = ?",
        )
        .bind(state.as_str())
        .bind(kind.map(|k| k.as_str()))
        .bind(message)
        .bind(task_id)
        .bind(TaskState::Running.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing task from one in the wrong state.
            return match self.get(task_id).await? {
                None => Err(QueueError::TaskNotFound(task_id)),
                Some(task) => Err(QueueError::InvalidTransition {
                    id: task_id,
                    state: task.state_str,
                    operation: "complete",
                }),
            };
        }
        Ok(())
    }

    /// Cancels a `Queued` or `Retrying` task.
    ///
    /// Returns true if the task was flipped to `Cancelled`; false if it is
    /// `Running` (the scheduler signals those cooperatively) or already
    /// terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TaskNotFound`] for an unknown id, or
    /// [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE id = ? AND state IN (?, ?)",
        )
        .bind(TaskState::Cancelled.as_str())
        .bind(task_id)
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Retrying.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.get(task_id).await?.is_none() {
            return Err(QueueError::TaskNotFound(task_id));
        }
        Ok(false)
    }

    /// Resets all `Running` tasks back to `Queued`.
    ///
    /// Called at startup for crash recovery: any tasks left claimed by a
    /// previous process are returned to the queue for reprocessing. Safe
    /// because chapter content is only persisted before `Succeeded`, so a
    /// re-run overwrites rather than duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn recover_running(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET state = ?, updated_at = datetime('now')
              WHERE state = ?",
        )
        .bind(TaskState::Queued.as_str())
        .bind(TaskState::Running.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Gets a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, task_id: i64) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(r"SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(task)
    }

    /// Counts tasks by state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_state(&self, state: TaskState) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM tasks WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Counts tasks that have not reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM tasks WHERE state IN (?, ?, ?)")
            .bind(TaskState::Queued.as_str())
            .bind(TaskState::Running.as_str())
            .bind(TaskState::Retrying.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Returns the earliest `next_eligible_at` among a source's `Retrying`
    /// tasks, or `None` when nothing is backing off. Workers park until
    /// this instant when only future retries remain.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn earliest_eligible(&self, source_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r"SELECT MIN(next_eligible_at) as due FROM tasks WHERE source_id = ? AND state = ?",
        )
        .bind(source_id)
        .bind(TaskState::Retrying.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.try_get::<Option<i64>, _>("due").unwrap_or(None))
    }

    /// Lists tasks filtered by state, in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r"SELECT * FROM tasks
              WHERE state = ?
              ORDER BY priority ASC, enqueued_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(tasks)
    }

    /// Lists all tasks in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r"SELECT * FROM tasks ORDER BY priority ASC, enqueued_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(tasks)
    }

    /// Removes terminal tasks (succeeded, failed, cancelled) and any
    /// batches left without members.
    ///
    /// # Returns
    ///
    /// The number of tasks removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if a delete fails.
    #[instrument(skip(self))]
    pub async fn prune_terminal(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM tasks WHERE state IN (?, ?, ?)")
            .bind(TaskState::Succeeded.as_str())
            .bind(TaskState::Failed.as_str())
            .bind(TaskState::Cancelled.as_str())
            .execute(self.db.pool())
            .await?;

        sqlx::query(r"DELETE FROM batches WHERE id NOT IN (SELECT DISTINCT batch_id FROM tasks WHERE batch_id IS NOT NULL)")
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Derives the aggregate report for a batch from its member tasks.
    ///
    /// Partial success is the normal shape of a finished batch: per-task
    /// errors are preserved, and the batch itself is never an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::BatchNotFound`] for an unknown id, or
    /// [`QueueError::Database`] if a query fails.
    #[instrument(skip(self))]
    pub async fn batch_report(&self, batch_id: i64) -> Result<BatchReport> {
        let batch = sqlx::query_as::<_, Batch>(r"SELECT * FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(self.db.pool())
            .await?;
        if batch.is_none() {
            return Err(QueueError::BatchNotFound(batch_id));
        }

        let members = sqlx::query_as::<_, Task>(
            r"SELECT * FROM tasks WHERE batch_id = ? ORDER BY enqueued_at ASC",
        )
        .bind(batch_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut report = BatchReport {
            batch_id,
            total: members.len(),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            pending: 0,
            errors: Vec::new(),
        };

        for task in &members {
            match task.state() {
                TaskState::Succeeded => report.succeeded += 1,
                TaskState::Failed => {
                    report.failed += 1;
                    report.errors.push(BatchTaskError {
                        task_id: task.id,
                        chapter_id: task.chapter_id.clone(),
                        kind: task.error_kind(),
                        message: task.last_error.clone(),
                    });
                }
                TaskState::Cancelled => report.cancelled += 1,
                TaskState::Queued | TaskState::Running | TaskState::Retrying => {
                    report.pending += 1;
                }
            }
        }

        Ok(report)
    }
}
