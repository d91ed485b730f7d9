//! 纯文本看板渲染。

use std::fmt::Write;

use chaintrack::MetricKind;

use crate::ConfirmedMetricsSnapshot;

/// 看板附加信息（队列积压与死信数量）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DashboardExtras {
	pub pending: usize,
	pub dead_lettered: u64,
}

pub fn render_dashboard(snapshot: &ConfirmedMetricsSnapshot, extras: Option<DashboardExtras>) -> String {
	let mut out = String::new();
	let _ = writeln!(out, "Web App Tracker");
	let _ = writeln!(out, "Page Views: {}", snapshot.get(MetricKind::PageView));
	let _ = writeln!(out, "Interactions: {}", snapshot.get(MetricKind::Interaction));
	if let Some(extras) = extras {
		let _ = writeln!(out, "Pending: {}", extras.pending);
		let _ = writeln!(out, "Dead-lettered: {}", extras.dead_lettered);
	}
	out
}
