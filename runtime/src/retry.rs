use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 指数退避重试策略：`base × 2^attempts`，封顶后叠加小于 `base` 的随机抖动。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	pub jitter_ms: u64,
	/// 达到该尝试次数后无条件转入死信。
	pub max_attempts: u32,
	/// `Unknown` 结果的单独上限（应小于 `max_attempts`）。
	pub max_unknown_attempts: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay_ms: 100,
			max_delay_ms: 30_000,
			jitter_ms: 50,
			max_attempts: 8,
			max_unknown_attempts: 3,
		}
	}
}

impl RetryPolicy {
	/// 第 `attempts` 次尝试失败后的等待时长。
	///
	/// 抖动上限截断为 `base - 1`，未封顶前相邻两次延迟严格递增。
	pub fn delay_for(&self, attempts: u32) -> Duration {
		let max_jitter = self.jitter_ms.min(self.base_delay_ms.saturating_sub(1));
		let jitter = if max_jitter == 0 {
			0
		} else {
			rand::rng().random_range(0..=max_jitter)
		};
		Duration::from_millis(self.backoff_ms(attempts).saturating_add(jitter))
	}

	/// 不含抖动的退避时长。
	pub fn backoff_ms(&self, attempts: u32) -> u64 {
		let shift = attempts.min(32);
		let scaled = self.base_delay_ms.saturating_mul(1u64 << shift);
		scaled.min(self.max_delay_ms.max(self.base_delay_ms))
	}

	/// 是否已用尽重试预算。
	pub fn exhausted(&self, attempts: u32, unknown_failures: u32) -> bool {
		attempts >= self.max_attempts || unknown_failures >= self.max_unknown_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::RetryPolicy;

	#[test]
	fn backoff_doubles_until_cap() {
		let policy = RetryPolicy {
			base_delay_ms: 10,
			max_delay_ms: 100,
			jitter_ms: 0,
			..RetryPolicy::default()
		};
		let delays = (1..=5).map(|n| policy.backoff_ms(n)).collect::<Vec<_>>();
		assert_eq!(delays, vec![20, 40, 80, 100, 100]);
	}

	#[test]
	fn jitter_never_breaks_strict_growth_below_cap() {
		let policy = RetryPolicy {
			base_delay_ms: 10,
			max_delay_ms: 60_000,
			jitter_ms: 1_000,
			..RetryPolicy::default()
		};
		for _ in 0..200 {
			let delays = (1..=6).map(|n| policy.delay_for(n)).collect::<Vec<_>>();
			assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
			assert!(delays[0].as_millis() < 30);
		}
	}

	#[test]
	fn unknown_outcomes_have_their_own_budget() {
		let policy = RetryPolicy::default();
		assert!(!policy.exhausted(2, 2));
		assert!(policy.exhausted(2, 3));
		assert!(policy.exhausted(8, 0));
	}

	#[test]
	fn huge_attempt_counts_saturate() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.backoff_ms(u32::MAX), policy.max_delay_ms);
	}
}
