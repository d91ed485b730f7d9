//! 终态审计日志。
//!
//! 事件到达 `Confirmed` 或 `DeadLettered` 后，先在此写入终态记录，再从活跃队列移除。
//! 审计日志是终态结果的权威来源：恢复时以它为准，死信从不被静默丢弃。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chaintrack::{Backend, EventId, EventStatus, MetricEvent, MetricKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;
use crate::records::{RecordWriter, load_records};

/// 死信原因。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeadLetterReason {
	/// 后端明确拒绝，不重试。
	#[serde(rename_all = "camelCase")]
	Rejected { backend: Backend, message: String },
	/// 重试预算耗尽（总尝试次数或 Unknown 结果次数达到上限）。
	#[serde(rename_all = "camelCase")]
	AttemptsExhausted {
		attempts: u32,
		unknown_failures: u32,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		last_error: Option<String>,
	},
}

impl DeadLetterReason {
	/// 用于报告分组的短标签。
	pub fn label(&self) -> String {
		match self {
			Self::Rejected { backend, .. } => format!("rejected:{backend}"),
			Self::AttemptsExhausted { .. } => "attemptsExhausted".to_string(),
		}
	}
}

impl std::fmt::Display for DeadLetterReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Rejected { backend, message } => write!(f, "{backend} rejected: {message}"),
			Self::AttemptsExhausted {
				attempts,
				unknown_failures,
				last_error,
			} => {
				write!(f, "attempts exhausted after {attempts} (unknown={unknown_failures})")?;
				if let Some(error) = last_error {
					write!(f, ", last error: {error}")?;
				}
				Ok(())
			}
		}
	}
}

/// 终态结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TerminalOutcome {
	Confirmed,
	DeadLettered { reason: DeadLetterReason },
}

/// 一条终态审计记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
	pub event: MetricEvent,
	#[serde(flatten)]
	pub outcome: TerminalOutcome,
	pub recorded_at: DateTime<Utc>,
}

impl TerminalRecord {
	pub fn confirmed(event: MetricEvent) -> Self {
		Self {
			event,
			outcome: TerminalOutcome::Confirmed,
			recorded_at: Utc::now(),
		}
	}

	pub fn dead_lettered(event: MetricEvent, reason: DeadLetterReason) -> Self {
		Self {
			event,
			outcome: TerminalOutcome::DeadLettered { reason },
			recorded_at: Utc::now(),
		}
	}

	pub fn status(&self) -> EventStatus {
		match self.outcome {
			TerminalOutcome::Confirmed => EventStatus::Confirmed,
			TerminalOutcome::DeadLettered { .. } => EventStatus::DeadLettered,
		}
	}
}

/// 死信报告中的单条记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
	pub id: EventId,
	pub kind: MetricKind,
	pub value: u64,
	pub attempts: u32,
	pub reason: DeadLetterReason,
	pub recorded_at: DateTime<Utc>,
}

/// 死信报告（数量 + 原因），供运维排查。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterReport {
	pub count: u64,
	pub by_reason: BTreeMap<String, u64>,
	pub entries: Vec<DeadLetterEntry>,
}

impl DeadLetterReport {
	pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TerminalRecord>) -> Self {
		let mut report = Self::default();
		for record in records {
			if let TerminalOutcome::DeadLettered { reason } = &record.outcome {
				report.count += 1;
				*report.by_reason.entry(reason.label()).or_default() += 1;
				report.entries.push(DeadLetterEntry {
					id: record.event.id,
					kind: record.event.kind,
					value: record.event.value,
					attempts: record.event.attempts,
					reason: reason.clone(),
					recorded_at: record.recorded_at,
				});
			}
		}
		report
	}
}

/// 审计日志（append-only，同步写盘）。
///
/// 已知限制：内存索引 `recorded` 保存全部终态事件 ID，随审计日志单调增长，
/// 且 `open` 时需完整读取日志重建。长期运行需要按时间轮转审计文件。
#[derive(Debug)]
pub struct AuditLog {
	writer: RecordWriter,
	recorded: HashMap<EventId, EventStatus>,
}

impl AuditLog {
	/// 打开审计日志并加载已记录的事件 ID。
	pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self, QueueError> {
		let path = path.as_ref();
		let existing = load_records::<TerminalRecord>(path)?;
		let recorded = existing
			.records
			.iter()
			.map(|r| (r.event.id, r.status()))
			.collect();
		Ok(Self {
			writer: RecordWriter::open(path, fsync)?,
			recorded,
		})
	}

	/// 追加一条终态记录；同一事件只记录一次，重复调用返回 `false`。
	pub fn append(&mut self, record: &TerminalRecord) -> Result<bool, QueueError> {
		if self.recorded.contains_key(&record.event.id) {
			return Ok(false);
		}
		self.writer.append(record)?;
		self.recorded.insert(record.event.id, record.status());
		Ok(true)
	}

	pub fn contains(&self, id: EventId) -> bool {
		self.recorded.contains_key(&id)
	}

	/// 该事件已记录的终态。
	pub fn status_of(&self, id: EventId) -> Option<EventStatus> {
		self.recorded.get(&id).copied()
	}

	pub fn len(&self) -> usize {
		self.recorded.len()
	}

	pub fn is_empty(&self) -> bool {
		self.recorded.is_empty()
	}

	pub fn max_event_id(&self) -> Option<EventId> {
		self.recorded.keys().max().copied()
	}

	pub fn path(&self) -> PathBuf {
		self.writer.path().to_path_buf()
	}

	/// 读取全部终态记录。
	pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<TerminalRecord>, QueueError> {
		Ok(load_records::<TerminalRecord>(path)?.records)
	}
}
