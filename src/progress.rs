//! Fire-and-forget progress event sink.
//!
//! UI layers and notification surfaces observe the scheduler through this
//! interface. Delivery is best-effort: sinks must not block and cannot
//! fail; nothing in the core's correctness depends on a sink seeing an
//! event.

use tracing::info;

use crate::library::LibraryUpdateRun;
use crate::queue::{TaskKind, TaskState};

/// A task moved from one lifecycle state to another.
#[derive(Debug, Clone)]
pub struct TaskStateChanged {
    /// The task's id.
    pub task_id: i64,
    /// The task's kind.
    pub kind: TaskKind,
    /// Which source the task targets.
    pub source_id: String,
    /// The novel the task targets.
    pub novel_id: String,
    /// The chapter the task targets, when applicable.
    pub chapter_id: Option<String>,
    /// State before the transition.
    pub old_state: TaskState,
    /// State after the transition.
    pub new_state: TaskState,
}

/// Consumer of scheduler progress events.
pub trait ProgressSink: Send + Sync {
    /// Called on every observed task state transition.
    fn task_state_changed(&self, event: TaskStateChanged);

    /// Called when a library update run finishes.
    fn library_update_finished(&self, run: &LibraryUpdateRun);
}

/// Sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn task_state_changed(&self, _event: TaskStateChanged) {}

    fn library_update_finished(&self, _run: &LibraryUpdateRun) {}
}

/// Sink that logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn task_state_changed(&self, event: TaskStateChanged) {
        info!(
            task_id = event.task_id,
            kind = %event.kind,
            source = %event.source_id,
            novel = %event.novel_id,
            chapter = event.chapter_id.as_deref().unwrap_or("-"),
            from = %event.old_state,
            to = %event.new_state,
            "task state changed"
        );
    }

    fn library_update_finished(&self, run: &LibraryUpdateRun) {
        info!(
            novels_checked = run.novels_checked,
            novels_skipped = run.novels_skipped,
            new_chapters = run.new_chapters_found,
            errors = run.errors.len(),
            "library update finished"
        );
    }
}
