//! Novelsync Core Library
//!
//! This library provides the content acquisition scheduler for novelsync:
//! it accepts chapter download and library-update work, dispatches it
//! against heterogeneous, rate-limited novel sources, tracks per-item state
//! through retries and failures, and reports consistent progress to callers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`queue`] - Durable task queue with claim-on-read dispatch
//! - [`scheduler`] - Worker pool draining the queue through gated sources
//! - [`rate_limiter`] - Per-source call-window admission
//! - [`retry`] - Failure-kind retry decisions with exponential backoff
//! - [`source`] - The `SourceGateway` capability trait and registry
//! - [`library`] - Periodic library update coordination
//! - [`storage`] - Storage collaborator interface (chapters, library)
//! - [`progress`] - Fire-and-forget progress event sink

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod error;
pub mod library;
pub mod progress;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod storage;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use db::Database;
pub use error::ErrorKind;
pub use library::{CoordinatorError, LibraryUpdateCoordinator, LibraryUpdateRun};
pub use progress::{LogSink, NoopSink, ProgressSink, TaskStateChanged};
pub use queue::{
    Batch, BatchEnqueueOutcome, BatchReport, PRIORITY_BACKGROUND, PRIORITY_USER, QueueError, Task,
    TaskKind, TaskOutcome, TaskQueue, TaskSpec, TaskState, now_millis,
};
pub use rate_limiter::{RateLimitPolicy, RateLimiter};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy};
pub use scheduler::{CancelOutcome, Scheduler, SchedulerError, SchedulerStats, UpdateCheck};
pub use source::{CancelToken, FetchError, SourceDescriptor, SourceGateway, SourceRegistry};
pub use storage::{ChapterContent, LibraryNovel, NovelMeta, StorageBackend, StorageError};
