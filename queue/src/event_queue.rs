//! `EventQueue` 主模块。
//!
//! 队列是事件状态的唯一真相来源，也是唯一被多个并发任务修改的结构。
//! 所有变更（入队、租约与尝试计数、状态推进、重试调度、移除）都在同一把锁内
//! 先写日志、后改内存，保证对并发的 dequeue/ack 调用是原子的。
//!
//! 租约（lease）只存在于内存：被租出的事件不会再交给其他调用方；
//! 进程重启后所有非终态事件都会重新变为可调度。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chaintrack::{Backend, EventId, EventStatus, MetricEvent, MetricKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::audit::{AuditLog, DeadLetterReason, DeadLetterReport, TerminalRecord};
use crate::journal::{Journal, JournalRecord};
use crate::QueueError;

const JOURNAL_FILE: &str = "queue.journal";
const AUDIT_FILE: &str = "audit.log";
const NOTICE_CAPACITY: usize = 1024;

/// `EventQueue` 初始化配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	/// 日志与审计文件所在目录。
	pub dir: PathBuf,
	/// 每次写入后是否 fsync。
	pub fsync: bool,
	/// 移除多少条记录后压缩日志；0 表示从不自动压缩。
	pub compact_after: usize,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			dir: PathBuf::from("data"),
			fsync: true,
			compact_after: 1024,
		}
	}
}

impl QueueConfig {
	/// 使用默认参数、指定目录。
	pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			..Self::default()
		}
	}

	pub fn journal_path(&self) -> PathBuf {
		self.dir.join(JOURNAL_FILE)
	}

	pub fn audit_path(&self) -> PathBuf {
		self.dir.join(AUDIT_FILE)
	}
}

/// 队列变更通知（广播），用于状态轨迹观测与展示层刷新。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
	Enqueued {
		id: EventId,
		kind: MetricKind,
		value: u64,
	},
	Dispatched {
		id: EventId,
		attempts: u32,
	},
	Transition {
		id: EventId,
		from: EventStatus,
		to: EventStatus,
	},
	RetryScheduled {
		id: EventId,
		attempts: u32,
		delay: Duration,
	},
	Retired {
		id: EventId,
		status: EventStatus,
	},
}

/// 一次失败尝试的原因，决定重试调度时记录的内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCause {
	/// 结果不确定（超时等），单独计数并有更低的上限。
	pub unknown: bool,
	pub message: String,
}

/// `ack` 的结果：变更前状态 + 变更后的事件快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
	pub previous: EventStatus,
	pub event: MetricEvent,
}

impl AckOutcome {
	/// 本次确认是否使事件进入 `Confirmed`。
	pub fn confirmed_now(&self) -> bool {
		self.event.status == EventStatus::Confirmed && self.previous != EventStatus::Confirmed
	}
}

/// 打开队列时的恢复摘要。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	/// 恢复后的活跃事件数量。
	pub live: usize,
	/// 日志中已到达终态、恢复时补做移除的事件数量。
	pub finalized: usize,
	/// 是否丢弃了日志末尾残行。
	pub torn_tail: bool,
}

#[derive(Debug)]
struct Entry {
	event: MetricEvent,
	leased: bool,
}

#[derive(Debug)]
struct State {
	entries: BTreeMap<u64, Entry>,
	index: HashMap<EventId, u64>,
	next_seq: u64,
	journal: Journal,
	audit: AuditLog,
	removed_since_compaction: usize,
}

impl State {
	fn seq_of(&self, id: EventId) -> Result<u64, QueueError> {
		self.index.get(&id).copied().ok_or(QueueError::UnknownEvent(id))
	}

	fn entry_mut(&mut self, id: EventId) -> Result<&mut Entry, QueueError> {
		let seq = self.seq_of(id)?;
		self.entries.get_mut(&seq).ok_or(QueueError::UnknownEvent(id))
	}

	fn remove(&mut self, id: EventId, status: EventStatus) -> Result<MetricEvent, QueueError> {
		let seq = self.seq_of(id)?;
		self.journal.append(&JournalRecord::Removed { id, status })?;
		self.index.remove(&id);
		self.removed_since_compaction += 1;
		self.entries
			.remove(&seq)
			.map(|entry| entry.event)
			.ok_or(QueueError::UnknownEvent(id))
	}

	fn compact(&mut self) -> Result<usize, QueueError> {
		let written = self
			.journal
			.rewrite(self.entries.iter().map(|(seq, entry)| (*seq, &entry.event)))?;
		self.removed_since_compaction = 0;
		Ok(written)
	}
}

/// 持久化、有序、并发安全的事件队列。
#[derive(Debug)]
pub struct EventQueue {
	config: QueueConfig,
	state: Mutex<State>,
	notices: broadcast::Sender<QueueNotice>,
	recovery: RecoveryReport,
}

impl EventQueue {
	/// 打开（或创建）队列并回放持久化状态。
	///
	/// 日志中任何无法读取的记录都会导致 `QueueError::Corruption`，队列拒绝启动。
	/// 已写入审计日志但尚未移出队列的事件会在此补做移除。
	pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
		std::fs::create_dir_all(&config.dir)?;
		let (journal, replay) = Journal::open(config.journal_path(), config.fsync)?;
		let audit = AuditLog::open(config.audit_path(), config.fsync)?;

		let mut state = State {
			entries: BTreeMap::new(),
			index: HashMap::new(),
			next_seq: replay.next_seq,
			journal,
			audit,
			removed_since_compaction: 0,
		};
		for (seq, event) in replay.live {
			state.index.insert(event.id, seq);
			state.entries.insert(seq, Entry { event, leased: false });
		}

		let mut finalized = 0usize;
		let leftovers = state
			.entries
			.values()
			.filter(|entry| entry.event.is_terminal() || state.audit.contains(entry.event.id))
			.map(|entry| entry.event.clone())
			.collect::<Vec<_>>();
		for event in leftovers {
			let status = match state.audit.status_of(event.id) {
				Some(recorded) => recorded,
				None => {
					let record = match event.status {
						EventStatus::Confirmed => TerminalRecord::confirmed(event.clone()),
						_ => TerminalRecord::dead_lettered(
							event.clone(),
							DeadLetterReason::AttemptsExhausted {
								attempts: event.attempts,
								unknown_failures: event.unknown_failures,
								last_error: event.last_error.clone(),
							},
						),
					};
					state.audit.append(&record)?;
					record.status()
				}
			};
			state.remove(event.id, status)?;
			finalized += 1;
			tracing::info!(event_id = %event.id, %status, "finalized terminal event during recovery");
		}
		if finalized > 0 {
			state.compact()?;
		}

		let recovery = RecoveryReport {
			live: state.entries.len(),
			finalized,
			torn_tail: replay.torn_tail,
		};
		tracing::info!(
			dir = %config.dir.display(),
			live = recovery.live,
			finalized = recovery.finalized,
			torn_tail = recovery.torn_tail,
			"event queue opened"
		);

		let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
		Ok(Self {
			config,
			state: Mutex::new(state),
			notices,
			recovery,
		})
	}

	/// 入队并在返回前完成持久化。
	pub fn enqueue(&self, event: MetricEvent) -> Result<EventId, QueueError> {
		if event.is_terminal() {
			return Err(chaintrack::ModelError::TerminalStatus {
				id: event.id,
				status: event.status,
			}
			.into());
		}

		let mut state = self.lock()?;
		if state.index.contains_key(&event.id) || state.audit.contains(event.id) {
			return Err(QueueError::Duplicate(event.id));
		}

		let seq = state.next_seq;
		state.journal.append(&JournalRecord::Enqueued {
			seq,
			event: event.clone(),
		})?;
		state.next_seq += 1;
		state.index.insert(event.id, seq);
		let id = event.id;
		let (kind, value) = (event.kind, event.value);
		state.entries.insert(seq, Entry { event, leased: false });
		drop(state);

		tracing::debug!(event_id = %id, %kind, value, seq, "event enqueued");
		self.notify(QueueNotice::Enqueued { id, kind, value });
		Ok(id)
	}

	/// 租出最多 `limit` 个已到调度时间的事件（按入队顺序），并为每个事件累加一次尝试计数。
	///
	/// 已被租出的事件对其他调用方不可见，直到 `schedule_retry` / `release` / 移除。
	pub fn dequeue_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MetricEvent>, QueueError> {
		if limit == 0 {
			return Ok(Vec::new());
		}

		let mut state = self.lock()?;
		let ready = state
			.entries
			.iter()
			.filter(|(_, entry)| {
				!entry.leased && !entry.event.is_terminal() && entry.event.next_attempt_at <= now
			})
			.map(|(seq, _)| *seq)
			.take(limit)
			.collect::<Vec<_>>();

		let mut leased = Vec::with_capacity(ready.len());
		for seq in ready {
			let Some(entry) = state.entries.get(&seq) else {
				continue;
			};
			let mut event = entry.event.clone();
			event.attempts = event.attempts.saturating_add(1);
			state.journal.append(&JournalRecord::Updated {
				event: event.clone(),
			})?;
			if let Some(entry) = state.entries.get_mut(&seq) {
				entry.event = event.clone();
				entry.leased = true;
			}
			leased.push(event);
		}
		drop(state);

		for event in &leased {
			self.notify(QueueNotice::Dispatched {
				id: event.id,
				attempts: event.attempts,
			});
		}
		Ok(leased)
	}

	/// 记录某后端的确认。状态推进与持久化是原子的；两个后端都确认后进入 `Confirmed`。
	pub fn ack(&self, id: EventId, backend: Backend, receipt: &str) -> Result<AckOutcome, QueueError> {
		let mut state = self.lock()?;
		let entry = state.entry_mut(id)?;
		let previous = entry.event.status;
		let mut event = entry.event.clone();
		event.record_ack(backend, receipt)?;

		if event != entry.event {
			state.journal.append(&JournalRecord::Updated {
				event: event.clone(),
			})?;
			state.entry_mut(id)?.event = event.clone();
		}
		drop(state);

		if event.status != previous {
			tracing::debug!(event_id = %id, %backend, from = %previous, to = %event.status, "event acknowledged");
			self.notify(QueueNotice::Transition {
				id,
				from: previous,
				to: event.status,
			});
		}
		Ok(AckOutcome { previous, event })
	}

	/// 释放租约并设定下次尝试时间。
	pub fn schedule_retry(
		&self,
		id: EventId,
		delay: Duration,
		cause: RetryCause,
	) -> Result<MetricEvent, QueueError> {
		let next_attempt_at = Utc::now()
			+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));

		let mut state = self.lock()?;
		let entry = state.entry_mut(id)?;
		if entry.event.is_terminal() {
			return Err(chaintrack::ModelError::TerminalStatus {
				id,
				status: entry.event.status,
			}
			.into());
		}
		let mut event = entry.event.clone();
		event.next_attempt_at = next_attempt_at;
		if cause.unknown {
			event.unknown_failures = event.unknown_failures.saturating_add(1);
		}
		event.last_error = Some(cause.message);

		state.journal.append(&JournalRecord::Updated {
			event: event.clone(),
		})?;
		let entry = state.entry_mut(id)?;
		entry.event = event.clone();
		entry.leased = false;
		drop(state);

		self.notify(QueueNotice::RetryScheduled {
			id,
			attempts: event.attempts,
			delay,
		});
		Ok(event)
	}

	/// 只释放租约，不改变任何持久化字段。
	pub fn release(&self, id: EventId) -> Result<(), QueueError> {
		let mut state = self.lock()?;
		state.entry_mut(id)?.leased = false;
		Ok(())
	}

	/// 释放全部租约（关闭时中止在途提交后调用）。
	pub fn release_all(&self) -> Result<usize, QueueError> {
		let mut state = self.lock()?;
		let mut released = 0usize;
		for entry in state.entries.values_mut().filter(|entry| entry.leased) {
			entry.leased = false;
			released += 1;
		}
		Ok(released)
	}

	/// 写入 Confirmed 审计记录并将事件移出队列。
	pub fn retire(&self, id: EventId) -> Result<MetricEvent, QueueError> {
		let mut state = self.lock()?;
		let entry = state.entry_mut(id)?;
		if entry.event.status != EventStatus::Confirmed {
			return Err(QueueError::NotConfirmed {
				id,
				status: entry.event.status,
			});
		}
		let record = TerminalRecord::confirmed(entry.event.clone());
		state.audit.append(&record)?;
		let event = state.remove(id, EventStatus::Confirmed)?;
		self.maybe_compact(&mut state)?;
		drop(state);

		self.notify(QueueNotice::Retired {
			id,
			status: EventStatus::Confirmed,
		});
		Ok(event)
	}

	/// 将事件转入死信：写入审计记录后移出队列。任意非终态都可以进入死信。
	pub fn dead_letter(&self, id: EventId, reason: DeadLetterReason) -> Result<MetricEvent, QueueError> {
		let mut state = self.lock()?;
		let entry = state.entry_mut(id)?;
		let previous = entry.event.status;
		let mut event = entry.event.clone();
		event.mark_dead_lettered()?;

		state
			.audit
			.append(&TerminalRecord::dead_lettered(event.clone(), reason.clone()))?;
		state.remove(id, EventStatus::DeadLettered)?;
		self.maybe_compact(&mut state)?;
		drop(state);

		tracing::warn!(event_id = %id, kind = %event.kind, attempts = event.attempts, %reason, "event dead-lettered");
		self.notify(QueueNotice::Transition {
			id,
			from: previous,
			to: EventStatus::DeadLettered,
		});
		self.notify(QueueNotice::Retired {
			id,
			status: EventStatus::DeadLettered,
		});
		Ok(event)
	}

	/// 立即压缩日志。
	pub fn compact(&self) -> Result<usize, QueueError> {
		let mut state = self.lock()?;
		let written = state.compact()?;
		tracing::info!(records = written, "queue journal compacted");
		Ok(written)
	}

	/// 订阅队列变更通知。
	pub fn subscribe(&self) -> broadcast::Receiver<QueueNotice> {
		self.notices.subscribe()
	}

	/// 活跃事件数量（含在途）。
	pub fn len(&self) -> Result<usize, QueueError> {
		Ok(self.lock()?.entries.len())
	}

	/// 队列不可用时返回错误，而不是报告为空。
	pub fn is_empty(&self) -> Result<bool, QueueError> {
		Ok(self.len()? == 0)
	}

	/// 当前被租出（在途）的事件数量。
	pub fn in_flight(&self) -> Result<usize, QueueError> {
		let state = self.lock()?;
		Ok(state.entries.values().filter(|entry| entry.leased).count())
	}

	/// 按入队顺序返回活跃事件快照。
	pub fn pending_events(&self) -> Result<Vec<MetricEvent>, QueueError> {
		let state = self.lock()?;
		Ok(state.entries.values().map(|entry| entry.event.clone()).collect())
	}

	pub fn get(&self, id: EventId) -> Result<Option<MetricEvent>, QueueError> {
		let state = self.lock()?;
		Ok(state
			.index
			.get(&id)
			.and_then(|seq| state.entries.get(seq))
			.map(|entry| entry.event.clone()))
	}

	/// 最早的未租出事件的下次尝试时间（调度循环据此决定休眠时长）。
	pub fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
		let state = self.lock()?;
		Ok(state
			.entries
			.values()
			.filter(|entry| !entry.leased && !entry.event.is_terminal())
			.map(|entry| entry.event.next_attempt_at)
			.min())
	}

	/// 活跃队列与审计日志中出现过的最大事件 ID（用于恢复后约束 ID 生成器）。
	pub fn max_event_id(&self) -> Result<Option<EventId>, QueueError> {
		let state = self.lock()?;
		let live = state.entries.values().map(|entry| entry.event.id).max();
		Ok(live.max(state.audit.max_event_id()))
	}

	/// 读取全部终态记录。
	pub fn audit_records(&self) -> Result<Vec<TerminalRecord>, QueueError> {
		let _guard = self.lock()?;
		AuditLog::read_all(self.config.audit_path())
	}

	/// 死信报告（数量 + 原因）。
	pub fn dead_letter_report(&self) -> Result<DeadLetterReport, QueueError> {
		Ok(DeadLetterReport::from_records(&self.audit_records()?))
	}

	/// 当前日志文件中的记录数量。
	pub fn journal_records(&self) -> Result<usize, QueueError> {
		Ok(self.lock()?.journal.records())
	}

	pub fn recovery(&self) -> &RecoveryReport {
		&self.recovery
	}

	pub fn config(&self) -> &QueueConfig {
		&self.config
	}

	fn maybe_compact(&self, state: &mut State) -> Result<(), QueueError> {
		if self.config.compact_after > 0 && state.removed_since_compaction >= self.config.compact_after {
			let written = state.compact()?;
			tracing::info!(records = written, "queue journal compacted");
		}
		Ok(())
	}

	fn notify(&self, notice: QueueNotice) {
		let _ = self.notices.send(notice);
	}

	fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
		self.state
			.lock()
			.map_err(|_| QueueError::Unavailable("event queue lock poisoned".to_string()))
	}
}
