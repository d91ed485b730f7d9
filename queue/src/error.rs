use std::path::PathBuf;

use chaintrack::{EventId, EventStatus, ModelError};
use thiserror::Error;

/// 队列错误。`Corruption` 为致命错误：持久化记录无法读取时拒绝继续，而不是静默丢弃。
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("queue io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("queue record encoding error: {0}")]
	Encoding(#[from] serde_json::Error),

	#[error("queue corruption in {path:?} at line {line}: {reason}")]
	Corruption {
		path: PathBuf,
		line: usize,
		reason: String,
	},

	#[error("event {0} is already queued")]
	Duplicate(EventId),

	#[error("event {0} is not in the active queue")]
	UnknownEvent(EventId),

	#[error("event {id} cannot be retired while {status}")]
	NotConfirmed { id: EventId, status: EventStatus },

	#[error(transparent)]
	Model(#[from] ModelError),

	#[error("event queue unavailable: {0}")]
	Unavailable(String),
}

impl QueueError {
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Self::Io(_) | Self::Corruption { .. } | Self::Unavailable(_)
		)
	}
}
