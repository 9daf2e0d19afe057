//! Integration tests for the scheduler: batches, partial failure, retry
//! flow, rate pacing, concurrency caps, and cancellation, all against
//! scripted in-process sources and a real queue database.

mod support;

use std::sync::Arc;
use std::time::Duration;

use novelsync_core::{
    CancelOutcome, ErrorKind, RateLimitPolicy, TaskSpec, TaskState,
};
use tokio::time::Instant;

use support::{MockGateway, fast_config, harness};

// ==================== Round trip ====================

#[tokio::test]
async fn test_batch_round_trip_all_succeed() {
    let chapters = ["ch-1", "ch-2", "ch-3", "ch-4", "ch-5", "ch-6"];
    let gateway = Arc::new(MockGateway::new("src-a").with_chapters("novel-1", &chapters));
    let h = harness(vec![Arc::clone(&gateway)], fast_config()).await;

    let specs: Vec<_> = chapters
        .iter()
        .map(|ch| TaskSpec::download_chapter("src-a", "novel-1", *ch))
        .collect();
    let outcome = h
        .queue
        .enqueue_batch("novel-1", &specs)
        .await
        .expect("enqueue_batch failed");

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 6);
    assert_eq!(stats.failed(), 0);

    let report = h
        .queue
        .batch_report(outcome.batch_id)
        .await
        .expect("report failed");
    assert!(report.is_done());
    assert_eq!(report.succeeded, 6);
    assert_eq!(report.total, 6);

    // Storage saw exactly one durable save per chapter, no duplicates.
    let mut saved = h.storage.saved_chapters();
    assert_eq!(saved.len(), 6);
    saved.sort();
    saved.dedup();
    assert_eq!(saved.len(), 6);

    assert_eq!(gateway.total_calls(), 6);
}

// ==================== Partial failure ====================

#[tokio::test]
async fn test_batch_partial_failure_isolated() {
    let chapters = ["ch-1", "ch-2", "ch-3", "ch-4", "ch-5"];
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &chapters)
            .fail_chapter("novel-1", "ch-3", ErrorKind::ResourceNotFound),
    );
    let h = harness(vec![gateway], fast_config()).await;

    let specs: Vec<_> = chapters
        .iter()
        .map(|ch| TaskSpec::download_chapter("src-a", "novel-1", *ch))
        .collect();
    let outcome = h
        .queue
        .enqueue_batch("novel-1", &specs)
        .await
        .expect("enqueue_batch failed");

    h.scheduler.process_pending().await.expect("drain failed");

    let report = h
        .queue
        .batch_report(outcome.batch_id)
        .await
        .expect("report failed");
    assert!(report.is_done());
    assert_eq!(report.succeeded, 4, "siblings must be untouched by ch-3");
    assert_eq!(report.failed, 1);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].chapter_id.as_deref(), Some("ch-3"));
    assert_eq!(report.errors[0].kind, Some(ErrorKind::ResourceNotFound));

    // Not-found is fatal: one attempt, zero retries.
    let failed_task = h.queue.get(report.errors[0].task_id).await.unwrap().unwrap();
    assert_eq!(failed_task.attempt, 1);

    let saved = h.storage.saved_chapters();
    assert_eq!(saved.len(), 4);
    assert!(!saved.iter().any(|(_, ch)| ch == "ch-3"));
}

// ==================== Retry flow ====================

#[tokio::test]
async fn test_transient_failure_retried_through_queue() {
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &["ch-1"])
            .fail_chapter_times("novel-1", "ch-1", ErrorKind::NetworkTransient, 2),
    );
    let h = harness(vec![Arc::clone(&gateway)], fast_config()).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 1);
    assert_eq!(stats.retried(), 2);

    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Succeeded);
    assert_eq!(task.attempt, 3);
    assert_eq!(gateway.total_calls(), 3);
}

#[tokio::test]
async fn test_timeout_classified_transient_and_exhausted() {
    let mut config = fast_config();
    config.request_timeout_ms = 40;

    // Latency beyond the deadline: every attempt times out.
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &["ch-1"])
            .with_latency(Duration::from_millis(200)),
    );
    let h = harness(vec![gateway], config).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.failed(), 1);

    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(task.error_kind(), Some(ErrorKind::NetworkTransient));
    assert!(task.last_error.unwrap().contains("deadline"));
}

#[tokio::test]
async fn test_source_retry_after_delays_next_attempt() {
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &["ch-1"])
            .fail_chapter_with_retry_after(
                "novel-1",
                "ch-1",
                Duration::from_millis(400),
                1,
            ),
    );
    let h = harness(vec![Arc::clone(&gateway)], fast_config()).await;

    h.queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let started = Instant::now();
    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 1);

    // The second attempt had to wait out the source-mandated delay, which
    // far exceeds the policy's 10-40ms backoff.
    assert!(
        started.elapsed() >= Duration::from_millis(350),
        "retry-after was not honored: drained in {:?}",
        started.elapsed()
    );
    assert_eq!(gateway.total_calls(), 2);
}

// ==================== Rate limiting ====================

#[tokio::test]
async fn test_rate_limited_source_paces_dispatch() {
    let window = Duration::from_millis(300);
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &[])
            .with_rate_limit(RateLimitPolicy::new(2, window)),
    );
    let h = harness(vec![Arc::clone(&gateway)], fast_config()).await;

    for i in 0..10 {
        h.queue
            .enqueue(&TaskSpec::download_chapter(
                "src-a",
                "novel-1",
                format!("ch-{i}"),
            ))
            .await
            .expect("enqueue failed");
    }

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 10);

    // 10 calls at 2 per window cannot finish faster than ~5 windows.
    let times = gateway.content_call_times();
    assert_eq!(times.len(), 10);
    let span = *times.last().unwrap() - times[0];
    assert!(
        span >= window * 4 - Duration::from_millis(50),
        "10 calls finished in {span:?}, faster than 5 windows allow"
    );
}

// ==================== Concurrency caps ====================

#[tokio::test]
async fn test_in_flight_never_exceeds_source_budget() {
    let chapters: Vec<String> = (0..8).map(|i| format!("ch-{i}")).collect();
    let chapter_refs: Vec<&str> = chapters.iter().map(String::as_str).collect();

    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &chapter_refs)
            .with_max_concurrent(2)
            .with_latency(Duration::from_millis(30)),
    );
    let mut config = fast_config();
    config.workers = 6;
    let h = harness(vec![Arc::clone(&gateway)], config).await;

    for ch in &chapters {
        h.queue
            .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", ch))
            .await
            .expect("enqueue failed");
    }

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 8);
    assert!(
        gateway.max_in_flight() <= 2,
        "observed {} concurrent calls against a budget of 2",
        gateway.max_in_flight()
    );
}

#[tokio::test]
async fn test_sources_progress_independently() {
    let gateway_a = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &["ch-1", "ch-2"])
            .with_max_concurrent(2)
            .with_latency(Duration::from_millis(20)),
    );
    let gateway_b = Arc::new(
        MockGateway::new("src-b")
            .with_chapters("novel-9", &["ch-1", "ch-2"])
            .with_max_concurrent(2)
            .with_latency(Duration::from_millis(20)),
    );
    let h = harness(vec![Arc::clone(&gateway_a), Arc::clone(&gateway_b)], fast_config()).await;

    for ch in ["ch-1", "ch-2"] {
        h.queue
            .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", ch))
            .await
            .unwrap();
        h.queue
            .enqueue(&TaskSpec::download_chapter("src-b", "novel-9", ch))
            .await
            .unwrap();
    }

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 4);
    assert_eq!(gateway_a.total_calls(), 2);
    assert_eq!(gateway_b.total_calls(), 2);
    assert!(gateway_a.max_in_flight() <= 2);
    assert!(gateway_b.max_in_flight() <= 2);
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_queued_task_makes_no_source_calls() {
    let gateway = Arc::new(MockGateway::new("src-a").with_chapters("novel-1", &["ch-1"]));
    let h = harness(vec![Arc::clone(&gateway)], fast_config()).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let outcome = h.scheduler.cancel(id).await.expect("cancel failed");
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded() + stats.failed(), 0);

    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(gateway.total_calls(), 0, "cancelled work must not hit the source");
}

#[tokio::test]
async fn test_cancel_running_task_settles_cancelled() {
    let gateway = Arc::new(
        MockGateway::new("src-a")
            .with_chapters("novel-1", &["ch-1"])
            .hang_chapter("novel-1", "ch-1"),
    );
    let h = harness(vec![gateway], fast_config()).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let scheduler = h.scheduler.clone();
    let drain = tokio::spawn(async move { scheduler.process_pending().await });

    // Wait for the task to actually be claimed and in flight.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let state = h.queue.get(id).await.unwrap().unwrap().state();
        if state == TaskState::Running {
            break;
        }
        assert!(Instant::now() < deadline, "task never started running");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let outcome = h.scheduler.cancel(id).await.expect("cancel failed");
    assert_eq!(outcome, CancelOutcome::SignalledRunning);

    drain.await.expect("drain panicked").expect("drain failed");

    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(
        h.storage.saved_chapters().is_empty(),
        "cancelled download must not persist content"
    );
}

#[tokio::test]
async fn test_cancel_terminal_task_is_noop() {
    let gateway = Arc::new(MockGateway::new("src-a").with_chapters("novel-1", &["ch-1"]));
    let h = harness(vec![gateway], fast_config()).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");
    h.scheduler.process_pending().await.expect("drain failed");

    let outcome = h.scheduler.cancel(id).await.expect("cancel failed");
    assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Succeeded);
}

// ==================== Other task kinds ====================

#[tokio::test]
async fn test_fetch_meta_task_persists_metadata() {
    let gateway = Arc::new(MockGateway::new("src-a"));
    let h = harness(vec![gateway], fast_config()).await;

    h.queue
        .enqueue(&TaskSpec::fetch_novel_meta("src-a", "novel-1"))
        .await
        .expect("enqueue failed");

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 1);

    let meta = h.storage.saved_meta();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].novel_id, "novel-1");
}

#[tokio::test]
async fn test_task_for_unregistered_source_is_left_queued() {
    let gateway = Arc::new(MockGateway::new("src-a").with_chapters("novel-1", &["ch-1"]));
    let h = harness(vec![gateway], fast_config()).await;

    let orphan = h
        .queue
        .enqueue(&TaskSpec::download_chapter("ghost", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");
    h.queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");

    let stats = h.scheduler.process_pending().await.expect("drain failed");
    assert_eq!(stats.succeeded(), 1);

    // The orphan neither blocks the drain nor gets silently dropped.
    let task = h.queue.get(orphan).await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Queued);
}

// ==================== Progress events ====================

#[tokio::test]
async fn test_progress_events_trace_lifecycle() {
    let gateway = Arc::new(MockGateway::new("src-a").with_chapters("novel-1", &["ch-1"]));
    let h = harness(vec![gateway], fast_config()).await;

    let id = h
        .queue
        .enqueue(&TaskSpec::download_chapter("src-a", "novel-1", "ch-1"))
        .await
        .expect("enqueue failed");
    h.scheduler.process_pending().await.expect("drain failed");

    let events: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter(|e| e.task_id == id)
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].old_state, TaskState::Queued);
    assert_eq!(events[0].new_state, TaskState::Running);
    assert_eq!(events[1].old_state, TaskState::Running);
    assert_eq!(events[1].new_state, TaskState::Succeeded);
}
