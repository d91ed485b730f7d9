//! 已确认指标快照。

use std::collections::BTreeMap;
use std::sync::Arc;

use chaintrack::MetricKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 在订阅者之间共享的快照。
pub type SharedSnapshot = Arc<ConfirmedMetricsSnapshot>;

/// 已确认指标聚合快照，只由 `Confirmed` 事件派生。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedMetricsSnapshot {
	/// 按指标类型累计的数值。
	pub counts: BTreeMap<MetricKind, u64>,
	/// 已确认事件数量。
	pub confirmed_events: u64,
	/// 单调递增的版本号，每确认一个事件加一。
	pub version: u64,
	/// 最近一次更新时间。
	pub as_of: DateTime<Utc>,
}

impl Default for ConfirmedMetricsSnapshot {
	fn default() -> Self {
		Self {
			counts: BTreeMap::new(),
			confirmed_events: 0,
			version: 0,
			as_of: Utc::now(),
		}
	}
}

impl ConfirmedMetricsSnapshot {
	/// 指定类型的累计值，未出现过时为 0。
	pub fn get(&self, kind: MetricKind) -> u64 {
		self.counts.get(&kind).copied().unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.confirmed_events == 0
	}
}
