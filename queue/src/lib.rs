//! `queue` crate 入口。
//!
//! 职责：持久化、有序、并发安全的待提交事件队列，以及终态事件的审计日志。
//!
//! 模块分工：
//! - `records`：JSON lines 读写与截断尾行处理。
//! - `journal`：队列变更日志（append-only，支持压缩重写）。
//! - `audit`：终态记录（Confirmed / DeadLettered）与死信报告。
//! - `event_queue`：`EventQueue` 主体，租约、确认、重试调度、死信。
//!
//! 快速示例：
//! ```rust,no_run
//! use chaintrack::{EventId, MetricEvent, MetricKind};
//! use queue::{EventQueue, QueueConfig};
//!
//! let queue = EventQueue::open(QueueConfig::in_dir("/tmp/chaintrack")).expect("open queue");
//! let id = queue
//!     .enqueue(MetricEvent::new(EventId(1), MetricKind::PageView, 1))
//!     .expect("enqueue persists before returning");
//! let ready = queue.dequeue_ready(chrono::Utc::now(), 16).expect("lease ready events");
//! assert_eq!(ready[0].id, id);
//! ```

mod audit;
mod error;
mod event_queue;
mod journal;
mod records;

pub use audit::{AuditLog, DeadLetterEntry, DeadLetterReason, DeadLetterReport, TerminalOutcome, TerminalRecord};
pub use error::QueueError;
pub use event_queue::{AckOutcome, EventQueue, QueueConfig, QueueNotice, RecoveryReport, RetryCause};
pub use journal::{Journal, JournalRecord, JournalReplay};
