//! Periodic library update coordination.
//!
//! The external periodic trigger (an OS scheduler, a timer loop, a cron
//! shim) only calls [`LibraryUpdateCoordinator::trigger`] and reads the
//! returned summary. The coordinator enforces the single-active-run
//! invariant with one atomic flag - never a lock held for the run's
//! duration - so an overlapping trigger gets
//! [`CoordinatorError::AlreadyRunning`] back immediately and the periodic
//! schedule treats it as a no-op.
//!
//! Per-novel failures are collected into the run summary and never abort
//! the remaining novels; that partial-failure contract is what keeps one
//! dead source from silencing updates for the whole library.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::ErrorKind;
use crate::progress::ProgressSink;
use crate::queue::QueueError;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{StorageBackend, StorageError};

/// Error type for coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A run is already active; the caller should no-op, not fail its
    /// schedule.
    #[error("a library update run is already active")]
    AlreadyRunning,

    /// The library could not be enumerated at all.
    #[error("could not enumerate library: {0}")]
    Storage(#[from] StorageError),
}

/// One novel's failure during an update run.
#[derive(Debug, Clone, Serialize)]
pub struct NovelCheckError {
    /// The novel whose check failed.
    pub novel_id: String,
    /// Classified failure kind.
    pub kind: ErrorKind,
    /// Failure detail.
    pub message: String,
}

/// Summary of one library update run.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryUpdateRun {
    /// When the run started.
    pub started_at: SystemTime,
    /// When the run finished.
    pub finished_at: SystemTime,
    /// Novels the run looked at (including skipped ones).
    pub novels_checked: usize,
    /// Novels skipped because an equivalent check was already live or the
    /// check was cancelled mid-run.
    pub novels_skipped: usize,
    /// New chapters discovered across all checked novels.
    pub new_chapters_found: usize,
    /// Per-novel failures, by novel id.
    pub errors: Vec<NovelCheckError>,
}

impl LibraryUpdateRun {
    fn begin() -> Self {
        let now = SystemTime::now();
        Self {
            started_at: now,
            finished_at: now,
            novels_checked: 0,
            novels_skipped: 0,
            new_chapters_found: 0,
            errors: Vec::new(),
        }
    }
}

/// Resets the running flag even on early returns.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates periodic checks of every library novel for new chapters.
pub struct LibraryUpdateCoordinator {
    scheduler: Scheduler,
    storage: Arc<dyn StorageBackend>,
    progress: Arc<dyn ProgressSink>,
    running: AtomicBool,
}

impl LibraryUpdateCoordinator {
    /// Creates a coordinator over the given scheduler and collaborators.
    #[must_use]
    pub fn new(
        scheduler: Scheduler,
        storage: Arc<dyn StorageBackend>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            scheduler,
            storage,
            progress,
            running: AtomicBool::new(false),
        }
    }

    /// Returns true while a run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one library update cycle.
    ///
    /// Enumerates the library, asks the scheduler to check each novel for
    /// new chapters, and enqueues low-priority downloads for the deltas
    /// (unless a novel's auto-download preference is off, in which case
    /// the delta is only reported). The summary is published to the
    /// progress sink and returned.
    ///
    /// The enqueued downloads are drained by the scheduler's worker pool;
    /// whoever owns the scheduler calls
    /// [`Scheduler::process_pending`](crate::Scheduler::process_pending)
    /// after a run to execute them.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AlreadyRunning`] if a run is active -
    /// an idempotent no-op signal for the periodic trigger - or
    /// [`CoordinatorError::Storage`] if the library itself could not be
    /// enumerated.
    #[instrument(skip(self))]
    pub async fn trigger(&self) -> Result<LibraryUpdateRun, CoordinatorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("update run already active, trigger is a no-op");
            return Err(CoordinatorError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let novels = self.storage.library_novels().await?;
        info!(novels = novels.len(), "library update run starting");

        let mut run = LibraryUpdateRun::begin();
        for novel in &novels {
            run.novels_checked += 1;
            match self.scheduler.check_for_updates(novel).await {
                Ok(check) => {
                    if !check.new_chapters.is_empty() {
                        info!(
                            novel = %novel.novel_id,
                            title = %novel.title,
                            new_chapters = check.new_chapters.len(),
                            enqueued = check.enqueued,
                            "found new chapters"
                        );
                    }
                    run.new_chapters_found += check.new_chapters.len();
                }
                Err(SchedulerError::Queue(QueueError::DuplicateTask { .. })) => {
                    // A check for this novel is already in progress.
                    debug!(novel = %novel.novel_id, "check already in progress, skipping");
                    run.novels_skipped += 1;
                }
                Err(SchedulerError::CheckCancelled { .. }) => {
                    debug!(novel = %novel.novel_id, "check cancelled, skipping");
                    run.novels_skipped += 1;
                }
                Err(SchedulerError::CheckFailed {
                    novel_id,
                    kind,
                    message,
                }) => {
                    warn!(novel = %novel_id, %kind, "novel check failed");
                    run.errors.push(NovelCheckError {
                        novel_id,
                        kind,
                        message,
                    });
                }
                Err(e) => {
                    // Unknown source, queue trouble: recorded against the
                    // novel, never fatal for the rest of the run.
                    warn!(novel = %novel.novel_id, error = %e, "novel check errored");
                    run.errors.push(NovelCheckError {
                        novel_id: novel.novel_id.clone(),
                        kind: ErrorKind::Unknown,
                        message: e.to_string(),
                    });
                }
            }
        }

        run.finished_at = SystemTime::now();
        info!(
            novels_checked = run.novels_checked,
            novels_skipped = run.novels_skipped,
            new_chapters = run.new_chapters_found,
            errors = run.errors.len(),
            "library update run finished"
        );

        self.progress.library_update_finished(&run);
        Ok(run)
    }
}

impl std::fmt::Debug for LibraryUpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryUpdateCoordinator")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_guard_resets_flag_on_drop() {
        let flag = AtomicBool::new(true);
        {
            let _guard = RunGuard(&flag);
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_begin_has_empty_counters() {
        let run = LibraryUpdateRun::begin();
        assert_eq!(run.novels_checked, 0);
        assert_eq!(run.new_chapters_found, 0);
        assert!(run.errors.is_empty());
    }
}
