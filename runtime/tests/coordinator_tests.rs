use std::sync::Arc;
use std::time::Duration;

use backend::{
    ArchiveSubmitter, FaultScript, LedgerSubmitter, MemoryArchive, MemoryLedger, ScriptedArchive,
    ScriptedLedger, Step, SubmitFailure,
};
use chaintrack::{Backend, EventId, EventStatus, MetricEvent, MetricKind};
use chrono::Utc;
use monitor::StateView;
use queue::{DeadLetterReason, EventQueue, QueueConfig, QueueNotice};
use runtime::{CoordinatorConfig, EventOutcome, RetryPolicy, SubmissionCoordinator};
use tokio::sync::broadcast;

struct Harness {
    queue: Arc<EventQueue>,
    view: Arc<StateView>,
    ledger: Arc<ScriptedLedger<MemoryLedger>>,
    archive: Arc<ScriptedArchive<MemoryArchive>>,
    coordinator: SubmissionCoordinator,
    _dir: tempfile::TempDir,
}

fn harness(
    ledger_steps: Vec<Step>,
    archive_steps: Vec<Step>,
    retry: RetryPolicy,
    config: CoordinatorConfig,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = Arc::new(
        EventQueue::open(QueueConfig {
            fsync: false,
            ..QueueConfig::in_dir(dir.path())
        })
        .expect("open queue"),
    );
    let view = Arc::new(StateView::default());
    let ledger = Arc::new(ScriptedLedger::new(
        MemoryLedger::new("testnet"),
        Arc::new(FaultScript::new(ledger_steps)),
    ));
    let archive = Arc::new(ScriptedArchive::new(
        MemoryArchive::new(),
        Arc::new(FaultScript::new(archive_steps)),
    ));
    let timeout = Duration::from_millis(config.submit_timeout_ms);
    let coordinator = SubmissionCoordinator::new(
        Arc::clone(&queue),
        LedgerSubmitter::new(ledger.clone(), timeout),
        ArchiveSubmitter::new(archive.clone(), timeout),
        Arc::clone(&view),
        retry,
        config,
    );
    Harness {
        queue,
        view,
        ledger,
        archive,
        coordinator,
        _dir: dir,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 5,
        max_delay_ms: 10_000,
        jitter_ms: 2,
        max_attempts: 8,
        max_unknown_attempts: 3,
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        concurrency: 4,
        poll_interval_ms: 10,
        submit_timeout_ms: 1_000,
        shutdown_grace_ms: 1_000,
    }
}

fn transitions(rx: &mut broadcast::Receiver<QueueNotice>, id: EventId) -> Vec<EventStatus> {
    let mut trace = vec![EventStatus::Pending];
    while let Ok(notice) = rx.try_recv() {
        if let QueueNotice::Transition { id: seen, to, .. } = notice {
            if seen == id {
                trace.push(to);
            }
        }
    }
    trace
}

async fn wait_until_empty(queue: &EventQueue, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !queue.is_empty().expect("queue available") {
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain: {:?}", queue.pending_events());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn archive_first_then_ledger_confirms_page_view() {
    let h = harness(
        vec![Step::pass_after(50)],
        vec![Step::pass_after(10)],
        fast_retry(),
        fast_config(),
    );
    let mut notices = h.queue.subscribe();
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(1), MetricKind::PageView, 1))
        .expect("enqueue");

    let leased = h.queue.dequeue_ready(Utc::now(), 8).expect("lease");
    assert_eq!(leased.len(), 1);
    let outcome = h.coordinator.process_event(leased[0].clone()).await.expect("process");

    assert_eq!(outcome, EventOutcome::Confirmed);
    assert_eq!(
        transitions(&mut notices, id),
        vec![EventStatus::Pending, EventStatus::ArchiveAcked, EventStatus::Confirmed]
    );
    let snapshot = h.view.snapshot();
    assert_eq!(snapshot.get(MetricKind::PageView), 1);
    assert_eq!(snapshot.get(MetricKind::Interaction), 0);
    assert!(h.queue.is_empty().expect("queue available"));

    let audit = h.queue.audit_records().expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status(), EventStatus::Confirmed);
    assert!(audit[0].event.ledger_receipt.is_some());
    assert!(audit[0].event.archive_cid.as_deref().is_some_and(|cid| cid.starts_with("sha256:")));
}

#[tokio::test]
async fn ledger_rejection_dead_letters_without_touching_view() {
    let h = harness(
        vec![Step::rejected("contract reverted")],
        vec![Step::pass()],
        fast_retry(),
        fast_config(),
    );
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(2), MetricKind::PageView, 1))
        .expect("enqueue");

    let leased = h.queue.dequeue_ready(Utc::now(), 8).expect("lease");
    let outcome = h.coordinator.process_event(leased[0].clone()).await.expect("process");

    assert_eq!(outcome, EventOutcome::DeadLettered);
    assert!(h.view.snapshot().is_empty());
    assert!(h.queue.get(id).expect("get").is_none());
    assert_eq!(h.ledger.inner().entry_count(), 0);

    let report = h.queue.dead_letter_report().expect("report");
    assert_eq!(report.count, 1);
    assert_eq!(report.by_reason.get("rejected:ledger"), Some(&1));
    assert!(matches!(
        &report.entries[0].reason,
        DeadLetterReason::Rejected { backend: Backend::Ledger, message } if message == "contract reverted"
    ));
}

#[tokio::test]
async fn ledger_rejection_after_archive_ack_still_dead_letters() {
    let h = harness(
        vec![Step::Fail {
            after: Duration::from_millis(20),
            failure: SubmitFailure::Rejected("contract reverted".to_string()),
        }],
        vec![Step::pass()],
        fast_retry(),
        fast_config(),
    );
    let mut notices = h.queue.subscribe();
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(12), MetricKind::Interaction, 4))
        .expect("enqueue");

    let leased = h.queue.dequeue_ready(Utc::now(), 8).expect("lease");
    let outcome = h.coordinator.process_event(leased[0].clone()).await.expect("process");

    assert_eq!(outcome, EventOutcome::DeadLettered);
    assert_eq!(
        transitions(&mut notices, id),
        vec![EventStatus::Pending, EventStatus::ArchiveAcked, EventStatus::DeadLettered]
    );
    assert!(h.view.snapshot().is_empty());
    assert!(h.queue.get(id).expect("get").is_none());

    let report = h.queue.dead_letter_report().expect("report");
    assert_eq!(report.by_reason.get("rejected:ledger"), Some(&1));
    let audit = h.queue.audit_records().expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status(), EventStatus::DeadLettered);
    assert!(audit[0].event.archive_cid.is_some());
}

#[tokio::test]
async fn transient_failures_back_off_then_confirm_on_fourth_attempt() {
    let retry = RetryPolicy {
        base_delay_ms: 10,
        jitter_ms: 5,
        ..fast_retry()
    };
    let h = harness(
        vec![Step::transient("503"), Step::transient("503"), Step::transient("503")],
        vec![Step::transient("timeout"), Step::transient("timeout"), Step::transient("timeout")],
        retry,
        fast_config(),
    );
    let mut notices = h.queue.subscribe();
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(3), MetricKind::Interaction, 2))
        .expect("enqueue");

    let handle = h.coordinator.spawn();
    wait_until_empty(&h.queue, Duration::from_secs(5)).await;
    let summary = handle.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    let audit = h.queue.audit_records().expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].event.id, id);
    assert_eq!(audit[0].status(), EventStatus::Confirmed);
    assert_eq!(audit[0].event.attempts, 4);
    assert_eq!(summary.retries, 3);
    assert_eq!(summary.confirmed, 1);

    let mut delays = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let QueueNotice::RetryScheduled { delay, .. } = notice {
            delays.push(delay);
        }
    }
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] < w[1]), "delays not increasing: {delays:?}");

    let calls = h.ledger.script().calls();
    assert_eq!(calls.len(), 4);
    for (pair, delay) in calls.windows(2).zip(&delays) {
        assert!(pair[1] - pair[0] >= *delay);
    }
    assert_eq!(h.ledger.inner().total("interaction"), 2);
    assert_eq!(h.view.snapshot().get(MetricKind::Interaction), 2);
}

#[tokio::test]
async fn only_the_failed_backend_is_retried() {
    let h = harness(
        vec![Step::pass()],
        vec![Step::transient("gateway busy")],
        fast_retry(),
        fast_config(),
    );
    let mut notices = h.queue.subscribe();
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(4), MetricKind::PageView, 3))
        .expect("enqueue");

    let handle = h.coordinator.spawn();
    wait_until_empty(&h.queue, Duration::from_secs(5)).await;
    handle.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    assert_eq!(h.ledger.script().call_count(), 1);
    assert_eq!(h.archive.script().call_count(), 2);
    assert_eq!(
        transitions(&mut notices, id),
        vec![EventStatus::Pending, EventStatus::LedgerAcked, EventStatus::Confirmed]
    );
    assert_eq!(h.view.snapshot().get(MetricKind::PageView), 3);
}

#[tokio::test]
async fn repeated_unknown_outcomes_exhaust_the_smaller_budget() {
    let config = CoordinatorConfig {
        submit_timeout_ms: 30,
        ..fast_config()
    };
    let retry = RetryPolicy {
        max_unknown_attempts: 2,
        ..fast_retry()
    };
    let h = harness(vec![Step::pass()], vec![Step::Hang, Step::Hang], retry, config);
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(5), MetricKind::Interaction, 1))
        .expect("enqueue");

    let handle = h.coordinator.spawn();
    wait_until_empty(&h.queue, Duration::from_secs(5)).await;
    handle.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    let report = h.queue.dead_letter_report().expect("report");
    assert_eq!(report.count, 1);
    assert_eq!(report.entries[0].id, id);
    match &report.entries[0].reason {
        DeadLetterReason::AttemptsExhausted {
            attempts,
            unknown_failures,
            last_error,
        } => {
            assert_eq!(*attempts, 2);
            assert_eq!(*unknown_failures, 2);
            assert!(last_error.as_deref().is_some_and(|e| e.contains("timed out")));
        }
        other => panic!("unexpected reason {other:?}"),
    }
    assert!(h.view.snapshot().is_empty());
}

#[tokio::test]
async fn attempts_cap_dead_letters_unconditionally() {
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 2,
        jitter_ms: 0,
        ..fast_retry()
    };
    let h = harness(
        vec![Step::pass()],
        (0..10).map(|_| Step::fail(SubmitFailure::Transient("down".to_string()))).collect(),
        retry,
        fast_config(),
    );
    h.queue
        .enqueue(MetricEvent::new(EventId(6), MetricKind::PageView, 1))
        .expect("enqueue");

    let handle = h.coordinator.spawn();
    wait_until_empty(&h.queue, Duration::from_secs(5)).await;
    let summary = handle.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(h.archive.script().call_count(), 3);
    let audit = h.queue.audit_records().expect("audit");
    assert_eq!(audit[0].status(), EventStatus::DeadLettered);
    assert_eq!(audit[0].event.attempts, 3);
    assert_eq!(h.queue.dead_letter_report().expect("report").by_reason.get("attemptsExhausted"), Some(&1));
}

#[tokio::test]
async fn shutdown_aborts_hung_submissions_and_keeps_event_pending() {
    let config = CoordinatorConfig {
        submit_timeout_ms: 60_000,
        ..fast_config()
    };
    let h = harness(vec![Step::Hang], vec![Step::pass()], fast_retry(), config);
    let mut notices = h.queue.subscribe();
    let id = h
        .queue
        .enqueue(MetricEvent::new(EventId(7), MetricKind::PageView, 1))
        .expect("enqueue");

    let handle = h.coordinator.spawn();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(QueueNotice::Transition { to: EventStatus::ArchiveAcked, .. }) = notices.recv().await {
                break;
            }
        }
    })
    .await
    .expect("archive ack observed");

    let summary = handle.shutdown(Duration::from_millis(50)).await.expect("shutdown");
    assert_eq!(summary.aborted, 1);

    let event = h.queue.get(id).expect("get").expect("still queued");
    assert_eq!(event.status, EventStatus::ArchiveAcked);
    assert_eq!(event.attempts, 1);
    // 租约已释放，下一轮可以重新调度
    assert_eq!(h.queue.dequeue_ready(Utc::now(), 1).expect("lease").len(), 1);
}
