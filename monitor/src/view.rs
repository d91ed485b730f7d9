//! `StateView`：已确认指标的物化视图。
//!
//! 写入只来自协调器的确认步骤；每次写入在锁内生成新快照并整体替换，
//! 读取方拿到的永远是某个完整时间点的快照，不会看到更新了一半的聚合值。

use std::sync::{Arc, PoisonError, RwLock};

use chaintrack::{EventStatus, MetricEvent};
use chrono::Utc;
use tokio::sync::broadcast;

use crate::{ConfirmedMetricsSnapshot, SharedSnapshot};

/// `StateView` 初始化配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateViewConfig {
	/// 快照推送通道容量，慢订阅者落后超过该值会丢失中间版本。
	pub channel_capacity: usize,
}

impl Default for StateViewConfig {
	fn default() -> Self {
		Self { channel_capacity: 256 }
	}
}

#[derive(Debug)]
pub struct StateView {
	current: RwLock<SharedSnapshot>,
	sender: broadcast::Sender<SharedSnapshot>,
}

impl Default for StateView {
	fn default() -> Self {
		Self::new(StateViewConfig::default())
	}
}

impl StateView {
	pub fn new(config: StateViewConfig) -> Self {
		let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
		Self {
			current: RwLock::new(Arc::new(ConfirmedMetricsSnapshot::default())),
			sender,
		}
	}

	/// 启动时用审计日志中的已确认事件初始化视图（不在热路径上）。
	pub fn restore<'a>(&self, events: impl IntoIterator<Item = &'a MetricEvent>) -> SharedSnapshot {
		let mut next = ConfirmedMetricsSnapshot::default();
		for event in events.into_iter().filter(|e| e.status == EventStatus::Confirmed) {
			*next.counts.entry(event.kind).or_default() += event.value;
			next.confirmed_events += 1;
		}
		next.version = next.confirmed_events;
		self.publish(next)
	}

	/// 将一个已确认事件计入聚合。非 `Confirmed` 事件被忽略并返回 `None`。
	pub fn on_confirmed(&self, event: &MetricEvent) -> Option<SharedSnapshot> {
		if event.status != EventStatus::Confirmed {
			return None;
		}

		let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
		let mut next = ConfirmedMetricsSnapshot::clone(&guard);
		*next.counts.entry(event.kind).or_default() += event.value;
		next.confirmed_events += 1;
		next.version += 1;
		next.as_of = Utc::now();

		let shared = Arc::new(next);
		*guard = Arc::clone(&shared);
		let _ = self.sender.send(Arc::clone(&shared));
		Some(shared)
	}

	/// 当前时间点快照（显示层轮询接口）。
	pub fn snapshot(&self) -> SharedSnapshot {
		Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
	}

	/// 订阅后续每一个新快照。
	pub fn subscribe(&self) -> broadcast::Receiver<SharedSnapshot> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}

	fn publish(&self, snapshot: ConfirmedMetricsSnapshot) -> SharedSnapshot {
		let shared = Arc::new(snapshot);
		let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
		*guard = Arc::clone(&shared);
		let _ = self.sender.send(Arc::clone(&shared));
		shared
	}
}
