use std::sync::Arc;
use std::time::Duration;

use chaintrack::{Backend, MetricEvent};

use crate::error::SubmitFailure;
use crate::payload::ArchivePayload;
use crate::protocol::{ArchiveBackend, IdempotencyKey, LedgerBackend, LedgerEntry};

/// 单个后端对一次提交的确认。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub backend: Backend,
    pub receipt: String,
    /// 后端此前已记录过该事件。
    pub duplicate: bool,
}

/// 向账本后端幂等地提交单个事件。
#[derive(Clone)]
pub struct LedgerSubmitter {
    backend: Arc<dyn LedgerBackend>,
    timeout: Duration,
}

impl LedgerSubmitter {
    pub fn new(backend: Arc<dyn LedgerBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn network(&self) -> &str {
        self.backend.network()
    }

    /// 超时视为 `Unknown`：请求可能已经在后端生效。
    pub async fn submit(&self, event: &MetricEvent) -> Result<Ack, SubmitFailure> {
        let entry = LedgerEntry {
            key: IdempotencyKey::for_event(event.id),
            metric: event.kind.as_str().to_string(),
            value: event.value,
        };

        match tokio::time::timeout(self.timeout, self.submit_entry(&entry)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitFailure::Unknown(format!(
                "ledger submission timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn submit_entry(&self, entry: &LedgerEntry) -> Result<Ack, SubmitFailure> {
        if let Some(existing) = self.backend.lookup(&entry.key).await? {
            tracing::debug!(key = %entry.key, reference = %existing.reference, "ledger entry already recorded");
            return Ok(Ack {
                backend: Backend::Ledger,
                receipt: existing.reference,
                duplicate: true,
            });
        }

        let receipt = self.backend.record(entry).await?;
        Ok(Ack {
            backend: Backend::Ledger,
            receipt: receipt.reference,
            duplicate: receipt.duplicate,
        })
    }
}

/// 向内容寻址存储幂等地提交单个事件的载荷。
#[derive(Clone)]
pub struct ArchiveSubmitter {
    backend: Arc<dyn ArchiveBackend>,
    timeout: Duration,
}

impl ArchiveSubmitter {
    pub fn new(backend: Arc<dyn ArchiveBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub async fn submit(&self, event: &MetricEvent) -> Result<Ack, SubmitFailure> {
        let payload = ArchivePayload::from_event(event).to_bytes()?;

        match tokio::time::timeout(self.timeout, self.backend.put(&payload)).await {
            Ok(result) => {
                let receipt = result?;
                Ok(Ack {
                    backend: Backend::Archive,
                    receipt: receipt.cid.to_string(),
                    duplicate: receipt.duplicate,
                })
            }
            Err(_) => Err(SubmitFailure::Unknown(format!(
                "archive put timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chaintrack::{EventId, MetricEvent, MetricKind};

    use super::{ArchiveSubmitter, LedgerSubmitter};
    use crate::{FaultScript, MemoryArchive, MemoryLedger, ScriptedLedger, Step, SubmitFailure};

    #[tokio::test]
    async fn resubmitting_acked_event_does_not_double_record() {
        let ledger = Arc::new(MemoryLedger::new("testnet"));
        let submitter = LedgerSubmitter::new(ledger.clone(), Duration::from_secs(1));
        let event = MetricEvent::new(EventId(11), MetricKind::PageView, 5);

        let first = submitter.submit(&event).await.expect("first submit");
        let second = submitter.submit(&event).await.expect("second submit");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.receipt, second.receipt);
        assert_eq!(ledger.total("pageView"), 5);
        assert_eq!(ledger.entry_count(), 1);
    }

    #[tokio::test]
    async fn archive_resubmission_yields_same_content_id() {
        let archive = Arc::new(MemoryArchive::new());
        let submitter = ArchiveSubmitter::new(archive.clone(), Duration::from_secs(1));
        let event = MetricEvent::new(EventId(12), MetricKind::Interaction, 1);

        let first = submitter.submit(&event).await.expect("first put");
        let second = submitter.submit(&event).await.expect("second put");

        assert_eq!(first.receipt, second.receipt);
        assert!(second.duplicate);
        assert_eq!(archive.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_as_unknown() {
        let script = Arc::new(FaultScript::new([Step::Hang]));
        let ledger = ScriptedLedger::new(MemoryLedger::new("testnet"), script);
        let submitter = LedgerSubmitter::new(Arc::new(ledger), Duration::from_millis(100));
        let event = MetricEvent::new(EventId(13), MetricKind::PageView, 1);

        let failure = submitter.submit(&event).await.expect_err("must time out");
        assert!(matches!(failure, SubmitFailure::Unknown(_)));
    }
}
