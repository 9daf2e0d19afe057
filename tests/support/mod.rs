//! Shared fixtures for integration tests: scripted in-process sources,
//! an in-memory storage backend, and a recording progress sink.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;

use novelsync_core::{
    CancelToken, ChapterContent, Database, ErrorKind, FetchError, LibraryNovel,
    LibraryUpdateRun, NovelMeta, NoopSink, ProgressSink, RateLimitPolicy, RetryPolicy, Scheduler,
    SchedulerConfig, SourceDescriptor, SourceGateway, SourceRegistry, StorageBackend,
    StorageError, TaskQueue, TaskStateChanged,
};

/// Scripted failure for one chapter or one novel's listing.
#[derive(Debug, Clone)]
struct FailurePlan {
    kind: ErrorKind,
    retry_after: Option<Duration>,
    /// How many calls fail before succeeding; `None` fails forever.
    remaining: Option<u32>,
    /// Spin observing the cancel token instead of returning.
    hang_until_cancelled: bool,
}

impl FailurePlan {
    fn always(kind: ErrorKind) -> Self {
        Self {
            kind,
            retry_after: None,
            remaining: None,
            hang_until_cancelled: false,
        }
    }

    fn times(kind: ErrorKind, count: u32) -> Self {
        Self {
            kind,
            retry_after: None,
            remaining: Some(count),
            hang_until_cancelled: false,
        }
    }
}

/// Decrements the concurrency gauge when a call returns by any path.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-process source with scripted chapters, failures, and latency.
pub struct MockGateway {
    descriptor: SourceDescriptor,
    chapters: HashMap<String, Vec<String>>,
    chapter_failures: Mutex<HashMap<(String, String), FailurePlan>>,
    listing_failures: Mutex<HashMap<String, FailurePlan>>,
    /// Artificial per-call latency.
    latency: Duration,
    calls: AtomicUsize,
    content_call_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGateway {
    pub fn new(source_id: &str) -> Self {
        Self {
            descriptor: SourceDescriptor::new(source_id, format!("Mock {source_id}"))
                .with_rate_limit(RateLimitPolicy::new(1_000, Duration::from_secs(1)))
                .with_max_concurrent(8),
            chapters: HashMap::new(),
            chapter_failures: Mutex::new(HashMap::new()),
            listing_failures: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            content_call_times: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.descriptor = self.descriptor.with_rate_limit(policy);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.descriptor = self.descriptor.with_max_concurrent(max_concurrent);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_chapters(mut self, novel_id: &str, chapters: &[&str]) -> Self {
        self.chapters.insert(
            novel_id.to_string(),
            chapters.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Every fetch of this chapter fails with the given kind.
    pub fn fail_chapter(self, novel_id: &str, chapter_id: &str, kind: ErrorKind) -> Self {
        self.chapter_failures.lock().unwrap().insert(
            (novel_id.to_string(), chapter_id.to_string()),
            FailurePlan::always(kind),
        );
        self
    }

    /// The first `count` fetches of this chapter fail, then it succeeds.
    pub fn fail_chapter_times(
        self,
        novel_id: &str,
        chapter_id: &str,
        kind: ErrorKind,
        count: u32,
    ) -> Self {
        self.chapter_failures.lock().unwrap().insert(
            (novel_id.to_string(), chapter_id.to_string()),
            FailurePlan::times(kind, count),
        );
        self
    }

    /// The first `count` fetches are rejected as rate-limited with a
    /// source-mandated retry-after, then succeed.
    pub fn fail_chapter_with_retry_after(
        self,
        novel_id: &str,
        chapter_id: &str,
        retry_after: Duration,
        count: u32,
    ) -> Self {
        let mut plan = FailurePlan::times(ErrorKind::RateLimitExceeded, count);
        plan.retry_after = Some(retry_after);
        self.chapter_failures
            .lock()
            .unwrap()
            .insert((novel_id.to_string(), chapter_id.to_string()), plan);
        self
    }

    /// This chapter's fetch spins until its cancel token fires.
    pub fn hang_chapter(self, novel_id: &str, chapter_id: &str) -> Self {
        let mut plan = FailurePlan::always(ErrorKind::NetworkTransient);
        plan.hang_until_cancelled = true;
        self.chapter_failures
            .lock()
            .unwrap()
            .insert((novel_id.to_string(), chapter_id.to_string()), plan);
        self
    }

    /// The first `count` listings of this novel fail, then succeed.
    pub fn fail_listing_times(self, novel_id: &str, kind: ErrorKind, count: u32) -> Self {
        self.listing_failures
            .lock()
            .unwrap()
            .insert(novel_id.to_string(), FailurePlan::times(kind, count));
        self
    }

    /// Every listing of this novel fails with the given kind.
    pub fn fail_listing(self, novel_id: &str, kind: ErrorKind) -> Self {
        self.listing_failures
            .lock()
            .unwrap()
            .insert(novel_id.to_string(), FailurePlan::always(kind));
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Instants at which chapter-content calls arrived.
    pub fn content_call_times(&self) -> Vec<Instant> {
        self.content_call_times.lock().unwrap().clone()
    }

    /// High-water mark of concurrent in-flight calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(&self.in_flight)
    }

    /// Consumes one scripted failure, if any applies to this call.
    async fn apply_plan(
        &self,
        plan: Option<FailurePlan>,
        cancel: &CancelToken,
    ) -> Result<(), FetchError> {
        let Some(plan) = plan else { return Ok(()) };

        if plan.hang_until_cancelled {
            loop {
                if cancel.is_cancelled() {
                    return Err(FetchError::network_transient("call abandoned"));
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        let mut error = FetchError::new(plan.kind, "scripted failure");
        error.retry_after = plan.retry_after;
        Err(error)
    }

    /// Looks up and advances the failure plan for a chapter fetch.
    fn take_chapter_plan(&self, novel_id: &str, chapter_id: &str) -> Option<FailurePlan> {
        let mut failures = self.chapter_failures.lock().unwrap();
        let key = (novel_id.to_string(), chapter_id.to_string());
        take_plan(&mut failures, &key)
    }

    fn take_listing_plan(&self, novel_id: &str) -> Option<FailurePlan> {
        let mut failures = self.listing_failures.lock().unwrap();
        take_plan(&mut failures, &novel_id.to_string())
    }
}

/// Advances a counted plan and returns it if it still applies.
fn take_plan<K: std::hash::Hash + Eq + Clone>(
    failures: &mut HashMap<K, FailurePlan>,
    key: &K,
) -> Option<FailurePlan> {
    let plan = failures.get_mut(key)?;
    match plan.remaining {
        Some(0) => None,
        Some(n) => {
            plan.remaining = Some(n - 1);
            Some(plan.clone())
        }
        None => Some(plan.clone()),
    }
}

#[async_trait]
impl SourceGateway for MockGateway {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch_novel_meta(
        &self,
        novel_id: &str,
        _cancel: &CancelToken,
    ) -> Result<NovelMeta, FetchError> {
        let _guard = self.enter();
        tokio::time::sleep(self.latency).await;
        Ok(NovelMeta {
            novel_id: novel_id.to_string(),
            title: format!("Novel {novel_id}"),
            author: Some("Mock Author".to_string()),
            summary: None,
            cover_url: None,
        })
    }

    async fn fetch_chapter_list(
        &self,
        novel_id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, FetchError> {
        let _guard = self.enter();
        tokio::time::sleep(self.latency).await;
        let plan = self.take_listing_plan(novel_id);
        self.apply_plan(plan, cancel).await?;
        Ok(self.chapters.get(novel_id).cloned().unwrap_or_default())
    }

    async fn fetch_chapter_content(
        &self,
        novel_id: &str,
        chapter_id: &str,
        cancel: &CancelToken,
    ) -> Result<ChapterContent, FetchError> {
        let _guard = self.enter();
        self.content_call_times.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.latency).await;
        let plan = self.take_chapter_plan(novel_id, chapter_id);
        self.apply_plan(plan, cancel).await?;
        Ok(ChapterContent {
            chapter_id: chapter_id.to_string(),
            title: format!("Chapter {chapter_id}"),
            body: format!("Body of {novel_id}/{chapter_id}"),
        })
    }
}

/// In-memory storage backend recording every save.
#[derive(Default)]
pub struct MockStorage {
    saved: Mutex<Vec<(String, String)>>,
    known: Mutex<HashMap<String, HashSet<String>>>,
    novels: Mutex<Vec<LibraryNovel>>,
    meta: Mutex<Vec<NovelMeta>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_library_novel(&self, novel: LibraryNovel) {
        self.novels.lock().unwrap().push(novel);
    }

    pub fn add_known_chapters(&self, novel_id: &str, chapters: &[&str]) {
        self.known
            .lock()
            .unwrap()
            .entry(novel_id.to_string())
            .or_default()
            .extend(chapters.iter().map(ToString::to_string));
    }

    /// (novel, chapter) pairs in save order.
    pub fn saved_chapters(&self) -> Vec<(String, String)> {
        self.saved.lock().unwrap().clone()
    }

    pub fn saved_meta(&self) -> Vec<NovelMeta> {
        self.meta.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    async fn save_chapter_content(
        &self,
        novel_id: &str,
        chapter_id: &str,
        _content: &ChapterContent,
    ) -> Result<(), StorageError> {
        self.saved
            .lock()
            .unwrap()
            .push((novel_id.to_string(), chapter_id.to_string()));
        self.known
            .lock()
            .unwrap()
            .entry(novel_id.to_string())
            .or_default()
            .insert(chapter_id.to_string());
        Ok(())
    }

    async fn save_novel_meta(&self, meta: &NovelMeta) -> Result<(), StorageError> {
        self.meta.lock().unwrap().push(meta.clone());
        Ok(())
    }

    async fn known_chapter_ids(&self, novel_id: &str) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .known
            .lock()
            .unwrap()
            .get(novel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn library_novels(&self) -> Result<Vec<LibraryNovel>, StorageError> {
        Ok(self.novels.lock().unwrap().clone())
    }
}

/// Progress sink that records every event it sees.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TaskStateChanged>>,
    runs: Mutex<Vec<LibraryUpdateRun>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskStateChanged> {
        self.events.lock().unwrap().clone()
    }

    pub fn finished_runs(&self) -> Vec<LibraryUpdateRun> {
        self.runs.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn task_state_changed(&self, event: TaskStateChanged) {
        self.events.lock().unwrap().push(event);
    }

    fn library_update_finished(&self, run: &LibraryUpdateRun) {
        self.runs.lock().unwrap().push(run.clone());
    }
}

/// A scheduler wired to mock collaborators over a temp-file database.
pub struct Harness {
    pub scheduler: Scheduler,
    pub queue: TaskQueue,
    pub storage: Arc<MockStorage>,
    pub sink: Arc<RecordingSink>,
    _temp_dir: TempDir,
}

/// Builds a harness with the given sources and config.
pub async fn harness(gateways: Vec<Arc<MockGateway>>, config: SchedulerConfig) -> Harness {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let db = Database::new(&temp_dir.path().join("queue.db"))
        .await
        .expect("failed to create database");
    let queue = TaskQueue::new(db, config.retry.policy());

    let mut registry = SourceRegistry::new();
    for gateway in gateways {
        registry.register(gateway);
    }

    let storage = Arc::new(MockStorage::new());
    let sink = Arc::new(RecordingSink::new());

    let scheduler = Scheduler::new(
        queue.clone(),
        Arc::new(registry),
        Arc::clone(&storage) as Arc<dyn StorageBackend>,
        Arc::clone(&sink) as Arc<dyn ProgressSink>,
        config,
    )
    .expect("failed to build scheduler");

    Harness {
        scheduler,
        queue,
        storage,
        sink,
        _temp_dir: temp_dir,
    }
}

/// A fast retry config for tests: small real delays, no long waits.
pub fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.workers = 4;
    config.request_timeout_ms = 2_000;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config
}

/// Convenience: a queue over an in-memory database with default retries.
pub async fn memory_queue() -> TaskQueue {
    let db = Database::new_in_memory()
        .await
        .expect("failed to create in-memory database");
    TaskQueue::new(db, RetryPolicy::default())
}

/// Convenience: a no-op sink as the trait object the scheduler wants.
pub fn noop_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NoopSink)
}
