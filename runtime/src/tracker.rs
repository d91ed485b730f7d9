use std::sync::Arc;
use std::time::Duration;

use backend::{ArchiveBackend, ArchiveSubmitter, LedgerBackend, LedgerSubmitter};
use chaintrack::{EventId, EventStatus, IdGenerator, MetricEvent, MetricKind, ModelError};
use monitor::{DashboardExtras, SharedSnapshot, StateView, StateViewConfig, render_dashboard};
use queue::{DeadLetterReport, EventQueue, QueueError};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ConfigError, TrackerConfig};
use crate::coordinator::{CoordinatorHandle, SubmissionCoordinator};

/// 生产方与展示层可见的错误。
#[derive(Debug, Error)]
pub enum TrackerError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("event queue unavailable: {0}")]
	Queue(#[from] QueueError),
	#[error(transparent)]
	Model(#[from] ModelError),
	#[error("archive store unavailable: {0}")]
	Archive(#[source] std::io::Error),
	#[error("coordinator task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// 指标追踪门面：同步持久化入队，异步最终确认。
pub struct Tracker {
	config: TrackerConfig,
	queue: Arc<EventQueue>,
	view: Arc<StateView>,
	ids: IdGenerator,
	coordinator: SubmissionCoordinator,
}

impl Tracker {
	/// 打开（并恢复）持久化队列，用审计日志中的已确认事件初始化视图。
	pub fn open(
		config: TrackerConfig,
		ledger: Arc<dyn LedgerBackend>,
		archive: Arc<dyn ArchiveBackend>,
	) -> Result<Self, TrackerError> {
		config.validate()?;
		let queue = Arc::new(EventQueue::open(config.queue.clone())?);

		let view = Arc::new(StateView::new(StateViewConfig::default()));
		let history = queue.audit_records()?;
		let restored = view.restore(
			history
				.iter()
				.filter(|record| record.status() == EventStatus::Confirmed)
				.map(|record| &record.event),
		);

		let ids = IdGenerator::new(config.worker_id)?;
		if let Some(max) = queue.max_event_id()? {
			ids.fence(max)?;
		}

		let timeout = Duration::from_millis(config.coordinator.submit_timeout_ms);
		let coordinator = SubmissionCoordinator::new(
			Arc::clone(&queue),
			LedgerSubmitter::new(ledger, timeout),
			ArchiveSubmitter::new(archive, timeout),
			Arc::clone(&view),
			config.retry,
			config.coordinator,
		);

		let recovery = queue.recovery();
		tracing::info!(
			dir = %config.queue.dir.display(),
			pending = recovery.live,
			finalized = recovery.finalized,
			torn_tail = recovery.torn_tail,
			confirmed = restored.confirmed_events,
			"tracker opened"
		);

		Ok(Self {
			config,
			queue,
			view,
			ids,
			coordinator,
		})
	}

	/// 记录一条指标：持久化后返回 ID，确认在后台完成。
	pub fn record_metric(&self, kind: MetricKind, value: u64) -> Result<EventId, TrackerError> {
		let id = self.ids.next_id()?;
		self.queue.enqueue(MetricEvent::new(id, kind, value))?;
		self.coordinator.wake();
		Ok(id)
	}

	pub fn snapshot(&self) -> SharedSnapshot {
		self.view.snapshot()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SharedSnapshot> {
		self.view.subscribe()
	}

	pub fn dead_letter_report(&self) -> Result<DeadLetterReport, TrackerError> {
		Ok(self.queue.dead_letter_report()?)
	}

	pub fn dashboard(&self) -> Result<String, TrackerError> {
		let report = self.dead_letter_report()?;
		Ok(render_dashboard(
			&self.snapshot(),
			Some(DashboardExtras {
				pending: self.queue.len()?,
				dead_lettered: report.count,
			}),
		))
	}

	pub fn pending(&self) -> Result<usize, TrackerError> {
		Ok(self.queue.len()?)
	}

	pub fn queue(&self) -> &Arc<EventQueue> {
		&self.queue
	}

	pub fn config(&self) -> &TrackerConfig {
		&self.config
	}

	pub fn coordinator(&self) -> &SubmissionCoordinator {
		&self.coordinator
	}

	/// 启动后台调度循环。
	pub fn start(&self) -> CoordinatorHandle {
		self.coordinator.spawn()
	}

	/// 等待队列清空，超时返回 `false`；队列不可用时返回错误。
	pub async fn drain(&self, timeout: Duration) -> Result<bool, TrackerError> {
		let deadline = tokio::time::Instant::now() + timeout;
		let mut notices = self.queue.subscribe();
		while !self.queue.is_empty()? {
			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Ok(false);
			}
			let tick = remaining.min(Duration::from_millis(50));
			let _ = tokio::time::timeout(tick, notices.recv()).await;
		}
		Ok(true)
	}
}
