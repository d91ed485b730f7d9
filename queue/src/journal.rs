//! 队列变更日志。
//!
//! 每次队列变更（入队、状态/尝试次数更新、移除）都先写入日志再修改内存状态。
//! 重启时按顺序回放日志即可重建活跃队列。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chaintrack::{EventId, EventStatus, MetricEvent};
use serde::{Deserialize, Serialize};

use crate::QueueError;
use crate::records::{RecordWriter, load_records, rewrite_records};

/// 单条日志记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum JournalRecord {
	/// 新事件入队，`seq` 为全局入队顺序。
	Enqueued { seq: u64, event: MetricEvent },
	/// 事件字段更新（状态、尝试次数、下次尝试时间等），携带完整快照。
	Updated { event: MetricEvent },
	/// 事件到达终态并已写入审计日志后移出活跃队列。
	Removed { id: EventId, status: EventStatus },
}

/// 日志回放结果。
#[derive(Debug, Default)]
pub struct JournalReplay {
	/// 活跃事件，按入队顺序排列。
	pub live: BTreeMap<u64, MetricEvent>,
	/// 下一个可用的入队序号。
	pub next_seq: u64,
	/// 回放的记录总数。
	pub records: usize,
	/// 是否丢弃了末尾残行。
	pub torn_tail: bool,
}

/// 队列变更日志（append-only，同步写盘）。
#[derive(Debug)]
pub struct Journal {
	writer: RecordWriter,
	records: usize,
}

impl Journal {
	/// 回放已有日志并以 append 模式打开。
	pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<(Self, JournalReplay), QueueError> {
		let path = path.as_ref();
		let replay = Self::replay(path)?;
		let writer = RecordWriter::open(path, fsync)?;
		Ok((
			Self {
				writer,
				records: replay.records,
			},
			replay,
		))
	}

	/// 只读回放日志。
	pub fn replay(path: impl AsRef<Path>) -> Result<JournalReplay, QueueError> {
		let path = path.as_ref();
		let loaded = load_records::<JournalRecord>(path)?;
		let mut replay = JournalReplay {
			torn_tail: loaded.torn_tail,
			records: loaded.records.len(),
			..JournalReplay::default()
		};
		let mut index = HashMap::<EventId, u64>::new();

		for (record, line) in loaded.records.into_iter().zip(loaded.lines) {
			let corruption = |reason: String| QueueError::Corruption {
				path: path.to_path_buf(),
				line,
				reason,
			};
			match record {
				JournalRecord::Enqueued { seq, event } => {
					if index.contains_key(&event.id) {
						return Err(corruption(format!("event {} enqueued twice", event.id)));
					}
					if replay.live.contains_key(&seq) {
						return Err(corruption(format!("sequence {seq} reused")));
					}
					index.insert(event.id, seq);
					replay.live.insert(seq, event);
					replay.next_seq = replay.next_seq.max(seq + 1);
				}
				JournalRecord::Updated { event } => {
					let seq = index
						.get(&event.id)
						.copied()
						.ok_or_else(|| corruption(format!("update for unknown event {}", event.id)))?;
					replay.live.insert(seq, event);
				}
				JournalRecord::Removed { id, .. } => {
					let seq = index
						.remove(&id)
						.ok_or_else(|| corruption(format!("removal of unknown event {id}")))?;
					replay.live.remove(&seq);
				}
			}
		}

		Ok(replay)
	}

	pub fn append(&mut self, record: &JournalRecord) -> Result<(), QueueError> {
		self.writer.append(record)?;
		self.records += 1;
		Ok(())
	}

	/// 用活跃事件快照重写日志（压缩），并重新以 append 模式打开。
	pub fn rewrite<'a>(
		&mut self,
		live: impl IntoIterator<Item = (u64, &'a MetricEvent)>,
	) -> Result<usize, QueueError> {
		let snapshot = live
			.into_iter()
			.map(|(seq, event)| JournalRecord::Enqueued {
				seq,
				event: event.clone(),
			})
			.collect::<Vec<_>>();
		let path = self.writer.path().to_path_buf();
		let written = rewrite_records(&path, &snapshot)?;
		self.writer = RecordWriter::open(&path, self.writer.fsync())?;
		self.records = written;
		Ok(written)
	}

	/// 当前日志文件中的记录数量。
	pub fn records(&self) -> usize {
		self.records
	}

	pub fn path(&self) -> PathBuf {
		self.writer.path().to_path_buf()
	}
}
