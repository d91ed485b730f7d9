use std::sync::Arc;
use std::time::Duration;

use backend::{
    ArchiveSubmitter, FaultScript, LedgerSubmitter, MemoryArchive, MemoryLedger, ScriptedArchive,
    ScriptedLedger, Step, SubmitFailure,
};
use chaintrack::{EventId, MetricEvent, MetricKind};

#[tokio::test]
async fn lost_ledger_response_then_retry_records_once() {
    let script = Arc::new(FaultScript::new([Step::LandThenFail {
        after: Duration::ZERO,
        failure: SubmitFailure::Unknown("response lost".to_string()),
    }]));
    let ledger = Arc::new(ScriptedLedger::new(MemoryLedger::new("testnet"), script));
    let submitter = LedgerSubmitter::new(ledger.clone(), Duration::from_secs(1));
    let event = MetricEvent::new(EventId(100), MetricKind::Interaction, 7);

    let first = submitter.submit(&event).await;
    assert!(matches!(first, Err(SubmitFailure::Unknown(_))));

    let retry = submitter.submit(&event).await.expect("retry acks");
    assert!(retry.duplicate, "lookup must find the landed entry");
    assert_eq!(ledger.inner().total("interaction"), 7);
    assert_eq!(ledger.inner().entry_count(), 1);
    // 重试由幂等检查短路，没有再次调用 record
    assert_eq!(ledger.script().call_count(), 1);
}

#[tokio::test]
async fn archive_rejection_is_not_retryable() {
    let script = Arc::new(FaultScript::new([Step::rejected("payload too large")]));
    let archive = Arc::new(ScriptedArchive::new(MemoryArchive::new(), script));
    let submitter = ArchiveSubmitter::new(archive.clone(), Duration::from_secs(1));
    let event = MetricEvent::new(EventId(101), MetricKind::PageView, 1);

    let failure = submitter.submit(&event).await.expect_err("rejected");
    assert!(!failure.is_retryable());
    assert_eq!(failure.message(), "payload too large");
    assert_eq!(archive.inner().object_count(), 0);
}

#[tokio::test]
async fn concurrent_duplicate_submissions_record_single_value() {
    let ledger = Arc::new(MemoryLedger::new("testnet"));
    let submitter = LedgerSubmitter::new(ledger.clone(), Duration::from_secs(1));
    let event = MetricEvent::new(EventId(102), MetricKind::PageView, 3);

    let tasks = (0..16)
        .map(|_| {
            let submitter = submitter.clone();
            let event = event.clone();
            tokio::spawn(async move { submitter.submit(&event).await })
        })
        .collect::<Vec<_>>();

    let mut receipts = Vec::new();
    for task in tasks {
        receipts.push(task.await.expect("join").expect("ack").receipt);
    }
    receipts.dedup();
    assert_eq!(receipts.len(), 1);
    assert_eq!(ledger.total("pageView"), 3);
}
