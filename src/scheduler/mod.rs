//! Worker-pool scheduler draining the task queue through gated sources.
//!
//! The scheduler owns a fixed pool of workers multiplexed across all
//! registered sources. Each worker iteration claims a per-source slot,
//! checks the rate limiter (non-blocking - a denied source is skipped,
//! not waited on), claims one ready task, executes a single attempt
//! against the [`SourceGateway`], and reports the outcome back to the
//! queue. Retries re-enter through the queue's `Retrying` state, so
//! ordering and rate limits hold across attempts.
//!
//! One task's failure never propagates out of the worker loop: failures
//! are recorded on the task and surfaced through batch reports and
//! progress events.
//!
//! # Example
//!
//! ```ignore
//! use novelsync_core::{Database, NoopSink, RetryPolicy, Scheduler, SchedulerConfig, TaskQueue};
//!
//! let db = Database::new_in_memory().await?;
//! let queue = TaskQueue::new(db, RetryPolicy::default());
//! let scheduler = Scheduler::new(queue, registry, storage, Arc::new(NoopSink), SchedulerConfig::default())?;
//!
//! let outcome = queue.enqueue_batch("Lord of the Mysteries", &specs).await?;
//! let stats = scheduler.process_pending().await?;
//! let report = scheduler.queue().batch_report(outcome.batch_id).await?;
//! ```

mod slots;

pub use slots::{SlotGuard, SourceSlots};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::error::ErrorKind;
use crate::progress::{ProgressSink, TaskStateChanged};
use crate::queue::{
    PRIORITY_BACKGROUND, QueueError, Task, TaskKind, TaskOutcome, TaskQueue, TaskSpec, TaskState,
    now_millis,
};
use crate::rate_limiter::RateLimiter;
use crate::source::{CancelToken, FetchError, SourceGateway, SourceRegistry};
use crate::storage::{LibraryNovel, StorageBackend};

/// Minimum allowed worker pool size.
const MIN_WORKERS: usize = 1;

/// Maximum allowed worker pool size.
const MAX_WORKERS: usize = 64;

/// How long an idle worker parks when other workers still have tasks in
/// flight (their completion may schedule retries).
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Shortest park to avoid busy-spinning on a gated source.
const MIN_PARK: Duration = Duration::from_millis(5);

/// Longest park, so cancellations and newly due retries are noticed
/// promptly.
const MAX_PARK: Duration = Duration::from_millis(250);

/// Error type for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid worker pool size.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkerCount {
        /// The invalid value that was provided.
        value: usize,
    },

    /// A task or check referenced a source id with no registered gateway.
    #[error("no source registered under id {0:?}")]
    UnknownSource(String),

    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// An inline update check was cancelled before it could finish.
    #[error("update check task {task_id} was cancelled")]
    CheckCancelled {
        /// The cancelled check task's id.
        task_id: i64,
    },

    /// An inline update check exhausted its retries.
    #[error("update check for novel {novel_id} failed: {kind}: {message}")]
    CheckFailed {
        /// The novel whose check failed.
        novel_id: String,
        /// Classified failure kind.
        kind: ErrorKind,
        /// Failure detail.
        message: String,
    },
}

/// Result of cancelling a task through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was queued or retrying and is now `Cancelled`.
    Cancelled,
    /// The task is running; its in-flight call was signalled and the task
    /// becomes `Cancelled` once that call returns.
    SignalledRunning,
    /// The task had already reached a terminal state.
    AlreadyTerminal,
}

/// Result of checking one library novel for new chapters.
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    /// Which source was asked.
    pub source_id: String,
    /// The checked novel.
    pub novel_id: String,
    /// Chapter ids present upstream but not yet known locally.
    pub new_chapters: Vec<String>,
    /// How many download tasks were enqueued for the delta (0 when the
    /// novel's auto-download preference is off).
    pub enqueued: usize,
}

/// Counters from one `process_pending` drain.
///
/// Uses atomic counters for thread-safe updates from concurrent workers.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    cancelled: AtomicUsize,
}

impl SchedulerStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks that reached `Succeeded`.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Tasks that reached `Failed`.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Attempts that were rescheduled for retry.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Tasks that reached `Cancelled`.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Terminal outcomes observed (succeeded + failed + cancelled).
    #[must_use]
    pub fn total_terminal(&self) -> usize {
        self.succeeded() + self.failed() + self.cancelled()
    }

    fn record(&self, state: TaskState) {
        match state {
            TaskState::Succeeded => self.succeeded.fetch_add(1, Ordering::SeqCst),
            TaskState::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            TaskState::Retrying => self.retried.fetch_add(1, Ordering::SeqCst),
            TaskState::Cancelled => self.cancelled.fetch_add(1, Ordering::SeqCst),
            TaskState::Queued | TaskState::Running => 0,
        };
    }
}

struct SchedulerInner {
    queue: TaskQueue,
    registry: Arc<SourceRegistry>,
    storage: Arc<dyn StorageBackend>,
    progress: Arc<dyn ProgressSink>,
    limiter: RateLimiter,
    slots: SourceSlots,
    /// Cooperative cancellation signals for running tasks, by task id.
    cancel_tokens: DashMap<i64, CancelToken>,
    config: SchedulerConfig,
}

/// The content acquisition scheduler.
///
/// Cheap to clone; clones share the same queue, slots, limiter, and
/// cancellation state. Construct one value and inject it wherever download
/// entry points or the periodic coordinator need it - there is no ambient
/// global instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler over the given queue, sources, and
    /// collaborators.
    ///
    /// Each registered source's declared rate limit and concurrency budget
    /// are installed into the limiter and slot table.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidWorkerCount`] if the configured
    /// pool size is outside 1..=64.
    #[instrument(skip_all, fields(workers = config.workers, sources = registry.len()))]
    pub fn new(
        queue: TaskQueue,
        registry: Arc<SourceRegistry>,
        storage: Arc<dyn StorageBackend>,
        progress: Arc<dyn ProgressSink>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&config.workers) {
            return Err(SchedulerError::InvalidWorkerCount {
                value: config.workers,
            });
        }

        let limiter = RateLimiter::new(config.default_rate_limit.policy());
        let slots = SourceSlots::new();
        for source_id in registry.source_ids() {
            if let Some(gateway) = registry.get(source_id) {
                let descriptor = gateway.descriptor();
                limiter.register(source_id, descriptor.rate_limit);
                slots.register(source_id, descriptor.max_concurrent);
            }
        }

        debug!("creating scheduler");

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                queue,
                registry,
                storage,
                progress,
                limiter,
                slots,
                cancel_tokens: DashMap::new(),
                config,
            }),
        })
    }

    /// Returns the underlying task queue.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Returns the configured worker pool size.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.inner.config.workers
    }

    /// Drains the queue: runs the worker pool until no dispatchable work
    /// remains for any registered source.
    ///
    /// Workers wait out pending retry backoffs before exiting, so a drain
    /// only finishes once every claimed task has reached a terminal state
    /// or the queue holds nothing but tasks for unregistered sources.
    ///
    /// Individual task failures do NOT cause this method to error; they
    /// are recorded on the task and counted in the returned stats.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Queue`] only if the queue itself becomes
    /// unusable.
    #[instrument(skip(self))]
    pub async fn process_pending(&self) -> Result<SchedulerStats, SchedulerError> {
        let stats = Arc::new(SchedulerStats::new());
        let in_flight = Arc::new(AtomicUsize::new(0));

        info!(workers = self.inner.config.workers, "starting queue drain");

        let mut handles = Vec::with_capacity(self.inner.config.workers);
        for worker_idx in 0..self.inner.config.workers {
            let scheduler = self.clone();
            let stats = Arc::clone(&stats);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_idx, &stats, &in_flight).await;
            }));
        }

        for handle in handles {
            // Task panics are logged but don't fail the drain.
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler worker panicked");
            }
        }

        info!(
            succeeded = stats.succeeded(),
            failed = stats.failed(),
            retried = stats.retried(),
            cancelled = stats.cancelled(),
            "queue drain complete"
        );

        match Arc::try_unwrap(stats) {
            Ok(stats) => Ok(stats),
            Err(arc_stats) => {
                // All workers joined, so this is unreachable in practice;
                // rebuild from the atomic values rather than panic.
                let fallback = SchedulerStats::new();
                fallback
                    .succeeded
                    .store(arc_stats.succeeded(), Ordering::SeqCst);
                fallback.failed.store(arc_stats.failed(), Ordering::SeqCst);
                fallback
                    .retried
                    .store(arc_stats.retried(), Ordering::SeqCst);
                fallback
                    .cancelled
                    .store(arc_stats.cancelled(), Ordering::SeqCst);
                Ok(fallback)
            }
        }
    }

    /// One worker: rotate over sources, dispatch what is admissible, park
    /// when everything is gated, exit when nothing dispatchable remains.
    async fn worker_loop(&self, worker_idx: usize, stats: &SchedulerStats, in_flight: &AtomicUsize) {
        let sources: Vec<String> = self.inner.registry.source_ids().to_vec();
        if sources.is_empty() {
            debug!("no sources registered, worker exiting");
            return;
        }

        let mut rotation = worker_idx;
        loop {
            let mut dispatched = false;
            for i in 0..sources.len() {
                let source_id = &sources[(rotation + i) % sources.len()];
                match self.try_dispatch(source_id, stats, in_flight).await {
                    Ok(true) => dispatched = true,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(source = %source_id, error = %e, "dispatch failed");
                    }
                }
            }
            rotation = rotation.wrapping_add(1);

            if dispatched {
                continue;
            }

            match self.idle_park_duration(&sources).await {
                Some(park) => tokio::time::sleep(park.clamp(MIN_PARK, MAX_PARK)).await,
                None => {
                    if in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    // Another worker's in-flight task may yet schedule a
                    // retry; stay up until it lands.
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    /// How long to park an idle worker, or `None` when no registered
    /// source has present or future work.
    async fn idle_park_duration(&self, sources: &[String]) -> Option<Duration> {
        let mut park: Option<Duration> = None;
        for source_id in sources {
            let gated = match self.inner.queue.has_ready(source_id).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(source = %source_id, error = %e, "ready probe failed");
                    false
                }
            };
            if gated {
                // Work exists but the limiter or slots held it back.
                let wait = self
                    .inner
                    .limiter
                    .next_ready_in(source_id)
                    .unwrap_or(IDLE_POLL);
                park = Some(park.map_or(wait, |p| p.min(wait)));
                continue;
            }

            match self.inner.queue.earliest_eligible(source_id).await {
                Ok(Some(due_ms)) => {
                    let wait_ms = (due_ms - now_millis()).max(0);
                    #[allow(clippy::cast_sign_loss)]
                    let wait = Duration::from_millis(wait_ms as u64);
                    park = Some(park.map_or(wait, |p| p.min(wait)));
                }
                Ok(None) => {}
                Err(e) => warn!(source = %source_id, error = %e, "eligibility probe failed"),
            }
        }
        park
    }

    /// Attempts to claim and execute one task for the source.
    ///
    /// Returns `Ok(true)` if a task was executed, `Ok(false)` if the
    /// source had no admissible work this cycle.
    async fn try_dispatch(
        &self,
        source_id: &str,
        stats: &SchedulerStats,
        in_flight: &AtomicUsize,
    ) -> Result<bool, SchedulerError> {
        // Admission order: capacity, ready work, rate token, claim.
        let Some(slot) = self.inner.slots.try_claim(source_id) else {
            return Ok(false);
        };

        if !self.inner.queue.has_ready(source_id).await? {
            return Ok(false);
        }

        if !self.inner.limiter.try_acquire(source_id) {
            debug!(source = %source_id, "rate window exhausted, skipping source");
            return Ok(false);
        }

        let Some(task) = self
            .inner
            .queue
            .dequeue_ready(source_id, 1)
            .await?
            .into_iter()
            .next()
        else {
            // Raced with another worker between the probe and the claim.
            return Ok(false);
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let claimed_from = if task.attempt > 0 {
            TaskState::Retrying
        } else {
            TaskState::Queued
        };
        self.emit(&task, claimed_from, TaskState::Running);

        let outcome = self.execute_attempt(&task).await;
        drop(slot);

        match self.inner.queue.complete(task.id, outcome).await {
            Ok(new_state) => {
                stats.record(new_state);
                self.emit(&task, TaskState::Running, new_state);
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "failed to record task outcome");
            }
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(true)
    }

    /// Runs one attempt of a claimed task with a registered cancel token.
    async fn execute_attempt(&self, task: &Task) -> TaskOutcome {
        let token = CancelToken::new();
        self.inner.cancel_tokens.insert(task.id, token.clone());
        let outcome = self.run_task(task, &token).await;
        self.inner.cancel_tokens.remove(&task.id);
        outcome
    }

    /// Dispatches a task to its kind-specific execution path.
    async fn run_task(&self, task: &Task, token: &CancelToken) -> TaskOutcome {
        if token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        let Some(gateway) = self.inner.registry.get(&task.source_id) else {
            return TaskOutcome::FatalFailure {
                kind: ErrorKind::Unknown,
                message: format!("no source registered under id {:?}", task.source_id),
            };
        };

        match task.kind() {
            TaskKind::DownloadChapter => self.run_download(task, &gateway, token).await,
            TaskKind::FetchNovelMeta => self.run_fetch_meta(task, &gateway, token).await,
            TaskKind::FetchChapterList => self.run_fetch_list(task, &gateway, token).await,
            TaskKind::CheckLibraryUpdate => {
                let auto_download = self.lookup_auto_download(&task.novel_id).await;
                match self
                    .run_check(&gateway, &task.source_id, &task.novel_id, auto_download, token)
                    .await
                {
                    Ok(check) => {
                        debug!(
                            novel = %task.novel_id,
                            new_chapters = check.new_chapters.len(),
                            enqueued = check.enqueued,
                            "update check complete"
                        );
                        TaskOutcome::Success
                    }
                    Err(outcome) => outcome,
                }
            }
        }
    }

    async fn run_download(
        &self,
        task: &Task,
        gateway: &Arc<dyn SourceGateway>,
        token: &CancelToken,
    ) -> TaskOutcome {
        let Some(chapter_id) = task.chapter_id.as_deref() else {
            return TaskOutcome::FatalFailure {
                kind: ErrorKind::Unknown,
                message: "download task has no chapter id".to_string(),
            };
        };

        let fetched = match tokio::time::timeout(
            self.inner.config.request_timeout(),
            gateway.fetch_chapter_content(&task.novel_id, chapter_id, token),
        )
        .await
        {
            Err(_) => return self.timed_out(&task.source_id),
            Ok(Err(e)) => return self.fetch_failure(&task.source_id, &e, token),
            Ok(Ok(content)) => content,
        };

        // Checkpoint: cancelled content is discarded, never persisted.
        if token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        match self
            .inner
            .storage
            .save_chapter_content(&task.novel_id, chapter_id, &fetched)
            .await
        {
            Ok(()) => TaskOutcome::Success,
            Err(e) => TaskOutcome::RetryableFailure {
                kind: ErrorKind::Unknown,
                message: format!("chapter fetched but not saved: {e}"),
                retry_after: None,
            },
        }
    }

    async fn run_fetch_meta(
        &self,
        task: &Task,
        gateway: &Arc<dyn SourceGateway>,
        token: &CancelToken,
    ) -> TaskOutcome {
        let meta = match tokio::time::timeout(
            self.inner.config.request_timeout(),
            gateway.fetch_novel_meta(&task.novel_id, token),
        )
        .await
        {
            Err(_) => return self.timed_out(&task.source_id),
            Ok(Err(e)) => return self.fetch_failure(&task.source_id, &e, token),
            Ok(Ok(meta)) => meta,
        };

        if token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        match self.inner.storage.save_novel_meta(&meta).await {
            Ok(()) => TaskOutcome::Success,
            Err(e) => TaskOutcome::RetryableFailure {
                kind: ErrorKind::Unknown,
                message: format!("metadata fetched but not saved: {e}"),
                retry_after: None,
            },
        }
    }

    async fn run_fetch_list(
        &self,
        task: &Task,
        gateway: &Arc<dyn SourceGateway>,
        token: &CancelToken,
    ) -> TaskOutcome {
        match tokio::time::timeout(
            self.inner.config.request_timeout(),
            gateway.fetch_chapter_list(&task.novel_id, token),
        )
        .await
        {
            Err(_) => self.timed_out(&task.source_id),
            Ok(Err(e)) => self.fetch_failure(&task.source_id, &e, token),
            Ok(Ok(chapters)) => {
                debug!(novel = %task.novel_id, chapters = chapters.len(), "chapter list fetched");
                TaskOutcome::Success
            }
        }
    }

    /// Fetches the upstream chapter list, diffs it against known chapters,
    /// and enqueues low-priority downloads for the delta.
    async fn run_check(
        &self,
        gateway: &Arc<dyn SourceGateway>,
        source_id: &str,
        novel_id: &str,
        auto_download: bool,
        token: &CancelToken,
    ) -> Result<UpdateCheck, TaskOutcome> {
        let upstream = match tokio::time::timeout(
            self.inner.config.request_timeout(),
            gateway.fetch_chapter_list(novel_id, token),
        )
        .await
        {
            Err(_) => return Err(self.timed_out(source_id)),
            Ok(Err(e)) => return Err(self.fetch_failure(source_id, &e, token)),
            Ok(Ok(chapters)) => chapters,
        };

        if token.is_cancelled() {
            return Err(TaskOutcome::Cancelled);
        }

        let known = match self.inner.storage.known_chapter_ids(novel_id).await {
            Ok(known) => known,
            Err(e) => {
                return Err(TaskOutcome::RetryableFailure {
                    kind: ErrorKind::Unknown,
                    message: format!("could not load known chapters: {e}"),
                    retry_after: None,
                });
            }
        };

        let new_chapters: Vec<String> = upstream
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();

        let mut enqueued = 0;
        if auto_download {
            for chapter_id in &new_chapters {
                let spec = TaskSpec::download_chapter(source_id, novel_id, chapter_id)
                    .with_priority(PRIORITY_BACKGROUND);
                match self.inner.queue.enqueue(&spec).await {
                    Ok(_) => enqueued += 1,
                    // A user-initiated download of the same chapter is
                    // already live; nothing to add.
                    Err(QueueError::DuplicateTask { .. }) => {}
                    Err(e) => {
                        warn!(novel = %novel_id, chapter = %chapter_id, error = %e, "could not enqueue delta download");
                    }
                }
            }
        }

        Ok(UpdateCheck {
            source_id: source_id.to_string(),
            novel_id: novel_id.to_string(),
            new_chapters,
            enqueued,
        })
    }

    /// Checks one library novel for new chapters, inline.
    ///
    /// This is the coordinator's entry point. The check is recorded as a
    /// durable `CheckLibraryUpdate` task and executed through the same
    /// admission gates and retry policy as worker-dispatched tasks, then
    /// the found delta is returned. New chapters are enqueued as
    /// low-priority downloads unless the novel's auto-download preference
    /// is off, in which case the delta is only reported.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Queue`] with [`QueueError::DuplicateTask`] when
    ///   an equivalent check is already live ("already in progress").
    /// - [`SchedulerError::UnknownSource`] for an unregistered source.
    /// - [`SchedulerError::CheckFailed`] when retries are exhausted.
    /// - [`SchedulerError::CheckCancelled`] when the check was cancelled.
    #[instrument(skip(self, novel), fields(source = %novel.source_id, novel = %novel.novel_id))]
    pub async fn check_for_updates(
        &self,
        novel: &LibraryNovel,
    ) -> Result<UpdateCheck, SchedulerError> {
        let gateway = self
            .inner
            .registry
            .get(&novel.source_id)
            .ok_or_else(|| SchedulerError::UnknownSource(novel.source_id.clone()))?;

        let task_id = self
            .inner
            .queue
            .enqueue(&TaskSpec::check_library_update(
                &novel.source_id,
                &novel.novel_id,
            ))
            .await?;

        loop {
            // Wait politely for admission: a free slot plus a rate token.
            let slot = loop {
                if let Some(slot) = self.inner.slots.try_claim(&novel.source_id) {
                    if self.inner.limiter.try_acquire(&novel.source_id) {
                        break slot;
                    }
                    drop(slot);
                }
                let wait = self
                    .inner
                    .limiter
                    .next_ready_in(&novel.source_id)
                    .unwrap_or(IDLE_POLL);
                tokio::time::sleep(wait.clamp(MIN_PARK, MAX_PARK)).await;
            };

            let Some(task) = self.inner.queue.claim(task_id).await? else {
                drop(slot);
                match self.resolve_unclaimable_check(task_id, novel).await? {
                    CheckProgress::Settled(check) => return Ok(check),
                    CheckProgress::WaitAndRetry(wait) => {
                        tokio::time::sleep(wait.clamp(MIN_PARK, MAX_PARK)).await;
                        continue;
                    }
                }
            };

            let claimed_from = if task.attempt > 0 {
                TaskState::Retrying
            } else {
                TaskState::Queued
            };
            self.emit(&task, claimed_from, TaskState::Running);
            let token = CancelToken::new();
            self.inner.cancel_tokens.insert(task_id, token.clone());
            let result = self
                .run_check(
                    &gateway,
                    &novel.source_id,
                    &novel.novel_id,
                    novel.auto_download,
                    &token,
                )
                .await;
            self.inner.cancel_tokens.remove(&task_id);
            drop(slot);

            match result {
                Ok(check) => {
                    let new_state = self.inner.queue.complete(task_id, TaskOutcome::Success).await?;
                    self.emit(&task, TaskState::Running, new_state);
                    return Ok(check);
                }
                Err(outcome) => {
                    let new_state = self.inner.queue.complete(task_id, outcome).await?;
                    self.emit(&task, TaskState::Running, new_state);
                    match new_state {
                        TaskState::Retrying => {
                            // Sleep until the backoff is due, then try again.
                            if let Some(refreshed) = self.inner.queue.get(task_id).await? {
                                let wait_ms = (refreshed.next_eligible_at - now_millis()).max(0);
                                #[allow(clippy::cast_sign_loss)]
                                tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
                            }
                        }
                        TaskState::Cancelled => {
                            return Err(SchedulerError::CheckCancelled { task_id });
                        }
                        _ => {
                            let recorded = self.inner.queue.get(task_id).await?;
                            let (kind, message) = recorded
                                .map(|t| {
                                    (
                                        t.error_kind().unwrap_or(ErrorKind::Unknown),
                                        t.last_error.unwrap_or_default(),
                                    )
                                })
                                .unwrap_or((ErrorKind::Unknown, String::new()));
                            return Err(SchedulerError::CheckFailed {
                                novel_id: novel.novel_id.clone(),
                                kind,
                                message,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Works out what happened to a check task we could not claim: a
    /// worker may have taken it, it may be backing off, or it may have
    /// been cancelled underneath us.
    async fn resolve_unclaimable_check(
        &self,
        task_id: i64,
        novel: &LibraryNovel,
    ) -> Result<CheckProgress, SchedulerError> {
        let Some(current) = self.inner.queue.get(task_id).await? else {
            return Err(SchedulerError::Queue(QueueError::TaskNotFound(task_id)));
        };
        match current.state() {
            TaskState::Retrying => {
                let wait_ms = (current.next_eligible_at - now_millis()).max(0);
                #[allow(clippy::cast_sign_loss)]
                Ok(CheckProgress::WaitAndRetry(Duration::from_millis(
                    wait_ms as u64,
                )))
            }
            // A pool worker claimed it first; wait for it to settle.
            TaskState::Running | TaskState::Queued => Ok(CheckProgress::WaitAndRetry(IDLE_POLL)),
            TaskState::Succeeded => {
                debug!(task_id, "check ran on the worker pool; delta already handled");
                Ok(CheckProgress::Settled(UpdateCheck {
                    source_id: novel.source_id.clone(),
                    novel_id: novel.novel_id.clone(),
                    new_chapters: Vec::new(),
                    enqueued: 0,
                }))
            }
            TaskState::Cancelled => Err(SchedulerError::CheckCancelled { task_id }),
            TaskState::Failed => Err(SchedulerError::CheckFailed {
                novel_id: novel.novel_id.clone(),
                kind: current.error_kind().unwrap_or(ErrorKind::Unknown),
                message: current.last_error.unwrap_or_default(),
            }),
        }
    }

    /// Cancels a task wherever it currently is in its lifecycle.
    ///
    /// Queued and retrying tasks flip to `Cancelled` immediately; a
    /// running task gets its cooperative token signalled and settles to
    /// `Cancelled` once the in-flight call returns. Terminal tasks are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Queue`] with
    /// [`QueueError::TaskNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: i64) -> Result<CancelOutcome, SchedulerError> {
        if self.inner.queue.cancel(task_id).await? {
            if let Some(task) = self.inner.queue.get(task_id).await? {
                self.emit(&task, TaskState::Queued, TaskState::Cancelled);
            }
            return Ok(CancelOutcome::Cancelled);
        }

        if let Some(token) = self.inner.cancel_tokens.get(&task_id) {
            token.cancel();
            debug!(task_id, "signalled running task");
            return Ok(CancelOutcome::SignalledRunning);
        }

        Ok(CancelOutcome::AlreadyTerminal)
    }

    /// Classifies a timed-out source call.
    fn timed_out(&self, source_id: &str) -> TaskOutcome {
        debug!(source = %source_id, "source call timed out");
        TaskOutcome::RetryableFailure {
            kind: ErrorKind::NetworkTransient,
            message: format!(
                "source call exceeded {}ms deadline",
                self.inner.config.request_timeout_ms
            ),
            retry_after: None,
        }
    }

    /// Maps a gateway error onto a task outcome, honoring cancellation and
    /// recording any source-mandated delay with the limiter.
    fn fetch_failure(&self, source_id: &str, error: &FetchError, token: &CancelToken) -> TaskOutcome {
        // A cancelled fetch may surface as any error; cancellation wins.
        if token.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        if error.kind == ErrorKind::RateLimitExceeded {
            if let Some(delay) = error.retry_after {
                self.inner.limiter.record_retry_after(source_id, delay);
            }
        }

        TaskOutcome::RetryableFailure {
            kind: error.kind,
            message: error.message.clone(),
            retry_after: error.retry_after,
        }
    }

    /// Finds a library novel's auto-download preference; defaults to true
    /// for novels no longer enumerable (the enqueue-time decision stands).
    async fn lookup_auto_download(&self, novel_id: &str) -> bool {
        match self.inner.storage.library_novels().await {
            Ok(novels) => novels
                .iter()
                .find(|n| n.novel_id == novel_id)
                .is_none_or(|n| n.auto_download),
            Err(e) => {
                warn!(error = %e, "could not enumerate library, assuming auto-download");
                true
            }
        }
    }

    /// Best-effort progress event emission.
    fn emit(&self, task: &Task, old_state: TaskState, new_state: TaskState) {
        self.inner.progress.task_state_changed(TaskStateChanged {
            task_id: task.id,
            kind: task.kind(),
            source_id: task.source_id.clone(),
            novel_id: task.novel_id.clone(),
            chapter_id: task.chapter_id.clone(),
            old_state,
            new_state,
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.config.workers)
            .field("sources", &self.inner.registry.source_ids())
            .finish()
    }
}

/// Progress of an inline check that could not be claimed this instant.
enum CheckProgress {
    /// The check settled elsewhere; this is the result to report.
    Settled(UpdateCheck),
    /// Wait this long, then try claiming again.
    WaitAndRetry(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_stats_records_states() {
        let stats = SchedulerStats::new();
        stats.record(TaskState::Succeeded);
        stats.record(TaskState::Succeeded);
        stats.record(TaskState::Failed);
        stats.record(TaskState::Retrying);
        stats.record(TaskState::Cancelled);
        stats.record(TaskState::Running); // not counted

        assert_eq!(stats.succeeded(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.retried(), 1);
        assert_eq!(stats.cancelled(), 1);
        assert_eq!(stats.total_terminal(), 4);
    }

    #[test]
    fn test_cancel_outcome_equality() {
        assert_eq!(CancelOutcome::Cancelled, CancelOutcome::Cancelled);
        assert_ne!(CancelOutcome::Cancelled, CancelOutcome::SignalledRunning);
    }
}
