use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// 事件 ID，进程内唯一，按生成时间单调递增。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    PageView,
    Interaction,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::PageView, MetricKind::Interaction];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageView => "pageView",
            Self::Interaction => "interaction",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "pageview" | "pageviews" => Ok(Self::PageView),
            "interaction" | "interactions" => Ok(Self::Interaction),
            _ => Err(ModelError::InvalidKind(value.to_string())),
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
    Ledger,
    Archive,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ledger => "ledger",
            Self::Archive => "archive",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Ledger => Self::Archive,
            Self::Archive => Self::Ledger,
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件提交状态。
///
/// 只能沿 `Pending -> {LedgerAcked | ArchiveAcked} -> Confirmed` 前进，
/// 任意非终态都可以转入 `DeadLettered`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    Pending,
    LedgerAcked,
    ArchiveAcked,
    Confirmed,
    DeadLettered,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::LedgerAcked => "ledgerAcked",
            Self::ArchiveAcked => "archiveAcked",
            Self::Confirmed => "confirmed",
            Self::DeadLettered => "deadLettered",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::DeadLettered)
    }

    pub fn has_ack(self, backend: Backend) -> bool {
        matches!(
            (self, backend),
            (Self::Confirmed, _)
                | (Self::LedgerAcked, Backend::Ledger)
                | (Self::ArchiveAcked, Backend::Archive)
        )
    }

    /// 记录某个后端的确认后应进入的状态。重复确认同一后端不改变状态。
    pub fn with_ack(self, backend: Backend) -> Option<Self> {
        match (self, backend) {
            (Self::Pending, Backend::Ledger) => Some(Self::LedgerAcked),
            (Self::Pending, Backend::Archive) => Some(Self::ArchiveAcked),
            (Self::LedgerAcked, Backend::Archive) | (Self::ArchiveAcked, Backend::Ledger) => {
                Some(Self::Confirmed)
            }
            (Self::LedgerAcked, Backend::Ledger) | (Self::ArchiveAcked, Backend::Archive) => {
                Some(self)
            }
            (Self::Confirmed, _) | (Self::DeadLettered, _) => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::LedgerAcked | Self::ArchiveAcked) => true,
            (Self::LedgerAcked | Self::ArchiveAcked, Self::Confirmed) => true,
            (from, Self::DeadLettered) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub id: EventId,
    pub kind: MetricKind,
    pub value: u64,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub attempts: u32,
    #[serde(default)]
    pub unknown_failures: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_receipt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MetricEvent {
    pub fn new(id: EventId, kind: MetricKind, value: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            value,
            created_at: now,
            status: EventStatus::Pending,
            attempts: 0,
            unknown_failures: 0,
            next_attempt_at: now,
            ledger_receipt: None,
            archive_cid: None,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 该后端是否仍需提交（已确认的后端永不重复提交）。
    pub fn needs(&self, backend: Backend) -> bool {
        !self.is_terminal() && !self.status.has_ack(backend)
    }

    pub fn receipt(&self, backend: Backend) -> Option<&str> {
        match backend {
            Backend::Ledger => self.ledger_receipt.as_deref(),
            Backend::Archive => self.archive_cid.as_deref(),
        }
    }

    pub fn record_ack(
        &mut self,
        backend: Backend,
        receipt: impl Into<String>,
    ) -> Result<EventStatus, ModelError> {
        let next = self
            .status
            .with_ack(backend)
            .ok_or(ModelError::TerminalStatus {
                id: self.id,
                status: self.status,
            })?;

        if self.receipt(backend).is_none() {
            let receipt = Some(receipt.into());
            match backend {
                Backend::Ledger => self.ledger_receipt = receipt,
                Backend::Archive => self.archive_cid = receipt,
            }
        }
        self.status = next;
        Ok(next)
    }

    pub fn mark_dead_lettered(&mut self) -> Result<(), ModelError> {
        if self.is_terminal() {
            return Err(ModelError::TerminalStatus {
                id: self.id,
                status: self.status,
            });
        }
        self.status = EventStatus::DeadLettered;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, EventId, EventStatus, MetricEvent, MetricKind};
    use crate::ModelError;

    #[test]
    fn acks_commute_to_confirmed() {
        let mut ledger_first = MetricEvent::new(EventId(1), MetricKind::PageView, 1);
        assert_eq!(ledger_first.record_ack(Backend::Ledger, "tx-1"), Ok(EventStatus::LedgerAcked));
        assert_eq!(ledger_first.record_ack(Backend::Archive, "cid-1"), Ok(EventStatus::Confirmed));

        let mut archive_first = MetricEvent::new(EventId(2), MetricKind::PageView, 1);
        assert_eq!(archive_first.record_ack(Backend::Archive, "cid-2"), Ok(EventStatus::ArchiveAcked));
        assert_eq!(archive_first.record_ack(Backend::Ledger, "tx-2"), Ok(EventStatus::Confirmed));
        assert_eq!(archive_first.ledger_receipt.as_deref(), Some("tx-2"));
        assert_eq!(archive_first.archive_cid.as_deref(), Some("cid-2"));
    }

    #[test]
    fn duplicate_ack_keeps_status_and_first_receipt() {
        let mut event = MetricEvent::new(EventId(3), MetricKind::Interaction, 2);
        event.record_ack(Backend::Ledger, "tx-a").expect("first ack");
        let status = event.record_ack(Backend::Ledger, "tx-b").expect("duplicate ack");
        assert_eq!(status, EventStatus::LedgerAcked);
        assert_eq!(event.ledger_receipt.as_deref(), Some("tx-a"));
        assert!(!event.needs(Backend::Ledger));
        assert!(event.needs(Backend::Archive));
    }

    #[test]
    fn terminal_events_reject_transitions() {
        let mut event = MetricEvent::new(EventId(4), MetricKind::PageView, 1);
        event.mark_dead_lettered().expect("pending can be dead-lettered");
        assert!(matches!(
            event.record_ack(Backend::Archive, "cid"),
            Err(ModelError::TerminalStatus { .. })
        ));
        assert!(event.mark_dead_lettered().is_err());
        assert!(!event.needs(Backend::Ledger));
    }

    #[test]
    fn transition_table_is_monotonic() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(ArchiveAcked));
        assert!(LedgerAcked.can_transition_to(Confirmed));
        assert!(ArchiveAcked.can_transition_to(DeadLettered));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!LedgerAcked.can_transition_to(ArchiveAcked));
        assert!(!Confirmed.can_transition_to(DeadLettered));
        assert!(!DeadLettered.can_transition_to(Pending));
    }

    #[test]
    fn kind_parses_loose_spellings() {
        assert_eq!(MetricKind::parse("pageView"), Ok(MetricKind::PageView));
        assert_eq!(MetricKind::parse("page-views"), Ok(MetricKind::PageView));
        assert_eq!(MetricKind::parse("Interactions"), Ok(MetricKind::Interaction));
        assert!(MetricKind::parse("click").is_err());
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = MetricEvent::new(EventId(9), MetricKind::PageView, 1);
        let text = serde_json::to_string(&event).expect("serialize");
        assert!(text.contains("\"kind\":\"pageView\""));
        assert!(text.contains("\"status\":\"pending\""));
        assert!(text.contains("\"createdAt\""));
        let back: MetricEvent = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, event);
    }
}
