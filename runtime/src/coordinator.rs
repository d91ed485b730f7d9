//! 提交协调器：从队列租出就绪事件，并发推送到账本与归档，推进状态机。

use std::sync::Arc;
use std::time::Duration;

use backend::{ArchiveSubmitter, LedgerSubmitter, SubmitFailure};
use chaintrack::{Backend, EventId, MetricEvent};
use chrono::Utc;
use monitor::StateView;
use queue::{DeadLetterReason, EventQueue, QueueError, RetryCause};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::CoordinatorConfig;
use crate::retry::RetryPolicy;

/// 单个事件一次处理的结局。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
	Confirmed,
	DeadLettered,
	RetryScheduled { delay: Duration },
	/// 事件已被其他路径移出队列或租约已释放，无需进一步处理。
	Released,
}

/// 调度循环退出时的统计。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
	pub dispatched: u64,
	pub confirmed: u64,
	pub dead_lettered: u64,
	pub retries: u64,
	/// 关闭宽限期结束后被中止的在途任务数。
	pub aborted: usize,
}

#[derive(Debug)]
enum Branch {
	/// 事件已有该后端的确认，本次未提交。
	Skipped,
	Acked,
	Failed(SubmitFailure),
	/// 本分支因 `Rejected` 已将事件转入死信。
	DeadLettered,
	/// 事件在确认前已被移出队列。
	Stale,
}

struct Inner {
	queue: Arc<EventQueue>,
	ledger: LedgerSubmitter,
	archive: ArchiveSubmitter,
	view: Arc<StateView>,
	retry: RetryPolicy,
	config: CoordinatorConfig,
	wake: Notify,
}

#[derive(Clone)]
pub struct SubmissionCoordinator {
	inner: Arc<Inner>,
}

impl SubmissionCoordinator {
	pub fn new(
		queue: Arc<EventQueue>,
		ledger: LedgerSubmitter,
		archive: ArchiveSubmitter,
		view: Arc<StateView>,
		retry: RetryPolicy,
		config: CoordinatorConfig,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				queue,
				ledger,
				archive,
				view,
				retry,
				config,
				wake: Notify::new(),
			}),
		}
	}

	pub fn queue(&self) -> &Arc<EventQueue> {
		&self.inner.queue
	}

	pub fn view(&self) -> &Arc<StateView> {
		&self.inner.view
	}

	/// 提醒调度循环有新事件入队，避免等满一个轮询周期。
	pub fn wake(&self) {
		self.inner.wake.notify_one();
	}

	/// 在当前运行时上启动调度循环。
	pub fn spawn(&self) -> CoordinatorHandle {
		let (shutdown, signal) = watch::channel(None);
		let coordinator = self.clone();
		let task = tokio::spawn(async move { coordinator.run(signal).await });
		CoordinatorHandle {
			shutdown,
			task,
			default_grace: Duration::from_millis(self.inner.config.shutdown_grace_ms),
		}
	}

	/// 调度循环：直到收到关闭信号（携带宽限期）为止。
	///
	/// 只有致命的队列错误会使循环提前返回。
	pub async fn run(&self, mut shutdown: watch::Receiver<Option<Duration>>) -> Result<RunSummary, QueueError> {
		let inner = &self.inner;
		let concurrency = inner.config.concurrency.max(1);
		let poll_interval = Duration::from_millis(inner.config.poll_interval_ms.max(1));
		let permits = Arc::new(Semaphore::new(concurrency));
		let mut tasks: JoinSet<Result<(EventId, EventOutcome), QueueError>> = JoinSet::new();
		let mut summary = RunSummary::default();

		tracing::info!(
			concurrency,
			ledger = inner.ledger.network(),
			archive = inner.archive.name(),
			pending = inner.queue.len()?,
			"submission coordinator started"
		);

		let grace = loop {
			if let Some(grace) = *shutdown.borrow_and_update() {
				break grace;
			}

			while let Some(joined) = tasks.try_join_next() {
				absorb(joined, &mut summary)?;
			}

			let available = permits.available_permits();
			if available > 0 {
				for event in inner.queue.dequeue_ready(Utc::now(), available)? {
					let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
						inner.queue.release(event.id)?;
						break;
					};
					summary.dispatched += 1;
					let coordinator = self.clone();
					tasks.spawn(async move {
						let _permit = permit;
						let id = event.id;
						let result = coordinator.process_event(event).await;
						if result.is_err() {
							let _ = coordinator.inner.queue.release(id);
						}
						result.map(|outcome| (id, outcome))
					});
				}
			}

			let wait = if permits.available_permits() == 0 {
				poll_interval
			} else {
				inner
					.queue
					.next_ready_at()?
					.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
					.map(|until| until.min(poll_interval))
					.unwrap_or(poll_interval)
			};
			if wait.is_zero() && permits.available_permits() > 0 {
				tokio::task::yield_now().await;
				continue;
			}

			tokio::select! {
				changed = shutdown.changed() => {
					if changed.is_err() {
						break Duration::ZERO;
					}
				}
				Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
					absorb(joined, &mut summary)?;
				}
				_ = inner.wake.notified() => {}
				_ = tokio::time::sleep(wait) => {}
			}
		};

		tracing::info!(in_flight = tasks.len(), grace_ms = grace.as_millis() as u64, "submission coordinator stopping");
		let deadline = tokio::time::sleep(grace);
		tokio::pin!(deadline);
		loop {
			tokio::select! {
				joined = tasks.join_next() => match joined {
					Some(joined) => absorb(joined, &mut summary)?,
					None => break,
				},
				_ = &mut deadline => {
					summary.aborted = tasks.len();
					tasks.abort_all();
					while tasks.join_next().await.is_some() {}
					break;
				}
			}
		}

		// 中止的提交没有持久化任何结果，下次运行按已持久化状态重试
		let released = inner.queue.release_all()?;
		tracing::info!(
			dispatched = summary.dispatched,
			confirmed = summary.confirmed,
			dead_lettered = summary.dead_lettered,
			retries = summary.retries,
			aborted = summary.aborted,
			released,
			"submission coordinator stopped"
		);
		Ok(summary)
	}

	/// 处理一个已租出的事件：两个后端并发提交，任一成功立即记录。
	pub async fn process_event(&self, event: MetricEvent) -> Result<EventOutcome, QueueError> {
		let inner = &self.inner;
		tracing::debug!(event_id = %event.id, kind = %event.kind, attempts = event.attempts, status = %event.status, "dispatching event");

		let (ledger, archive) = tokio::join!(
			self.submit_branch(&event, Backend::Ledger),
			self.submit_branch(&event, Backend::Archive),
		);
		let (ledger, archive) = (ledger?, archive?);

		if matches!(ledger, Branch::DeadLettered) || matches!(archive, Branch::DeadLettered) {
			return Ok(EventOutcome::DeadLettered);
		}

		let failures = [(Backend::Ledger, ledger), (Backend::Archive, archive)]
			.into_iter()
			.filter_map(|(backend, branch)| match branch {
				Branch::Failed(failure) => Some((backend, failure)),
				_ => None,
			})
			.collect::<Vec<_>>();

		if failures.is_empty() {
			return match inner.queue.get(event.id)? {
				// 两侧都已确认时，确认分支已完成移除
				None => Ok(EventOutcome::Confirmed),
				Some(_) => {
					inner.queue.release(event.id)?;
					Ok(EventOutcome::Released)
				}
			};
		}

		let unknown = failures.iter().any(|(_, failure)| failure.is_unknown());
		let message = failures
			.iter()
			.map(|(backend, failure)| format!("{backend}: {failure}"))
			.collect::<Vec<_>>()
			.join("; ");
		let unknown_failures = event.unknown_failures + u32::from(unknown);

		if inner.retry.exhausted(event.attempts, unknown_failures) {
			let reason = DeadLetterReason::AttemptsExhausted {
				attempts: event.attempts,
				unknown_failures,
				last_error: Some(message),
			};
			return match inner.queue.dead_letter(event.id, reason) {
				Ok(_) => Ok(EventOutcome::DeadLettered),
				Err(QueueError::UnknownEvent(_)) => Ok(EventOutcome::Released),
				Err(error) => Err(error),
			};
		}

		let delay = inner.retry.delay_for(event.attempts);
		tracing::info!(
			event_id = %event.id,
			attempts = event.attempts,
			delay_ms = delay.as_millis() as u64,
			unknown,
			error = %message,
			"submission failed, retry scheduled"
		);
		match inner.queue.schedule_retry(event.id, delay, RetryCause { unknown, message }) {
			Ok(_) => Ok(EventOutcome::RetryScheduled { delay }),
			Err(QueueError::UnknownEvent(_)) => Ok(EventOutcome::Released),
			Err(error) => Err(error),
		}
	}

	async fn submit_branch(&self, event: &MetricEvent, backend: Backend) -> Result<Branch, QueueError> {
		if !event.needs(backend) {
			return Ok(Branch::Skipped);
		}

		let inner = &self.inner;
		let result = match backend {
			Backend::Ledger => inner.ledger.submit(event).await,
			Backend::Archive => inner.archive.submit(event).await,
		};

		match result {
			Ok(ack) => {
				let outcome = match inner.queue.ack(event.id, backend, &ack.receipt) {
					Ok(outcome) => outcome,
					Err(QueueError::UnknownEvent(_)) => {
						tracing::debug!(event_id = %event.id, %backend, "ack for event no longer queued");
						return Ok(Branch::Stale);
					}
					Err(error) => return Err(error),
				};
				tracing::debug!(event_id = %event.id, %backend, receipt = %ack.receipt, duplicate = ack.duplicate, "backend acknowledged");
				if outcome.confirmed_now() {
					self.confirm(event.id)?;
				}
				Ok(Branch::Acked)
			}
			Err(SubmitFailure::Rejected(message)) => {
				tracing::warn!(event_id = %event.id, %backend, error = %message, "submission rejected");
				let reason = DeadLetterReason::Rejected { backend, message };
				match inner.queue.dead_letter(event.id, reason) {
					Ok(_) => Ok(Branch::DeadLettered),
					Err(QueueError::UnknownEvent(_)) => Ok(Branch::Stale),
					Err(error) => Err(error),
				}
			}
			Err(failure) => {
				tracing::debug!(event_id = %event.id, %backend, error = %failure, "submission failed");
				Ok(Branch::Failed(failure))
			}
		}
	}

	/// 事件进入 `Confirmed`：写审计并移出队列，再更新视图。
	fn confirm(&self, id: EventId) -> Result<(), QueueError> {
		let event = self.inner.queue.retire(id)?;
		self.inner.view.on_confirmed(&event);
		tracing::info!(event_id = %id, kind = %event.kind, value = event.value, attempts = event.attempts, "event confirmed");
		Ok(())
	}
}

fn absorb(
	joined: Result<Result<(EventId, EventOutcome), QueueError>, tokio::task::JoinError>,
	summary: &mut RunSummary,
) -> Result<(), QueueError> {
	match joined {
		Ok(Ok((_, EventOutcome::Confirmed))) => summary.confirmed += 1,
		Ok(Ok((_, EventOutcome::DeadLettered))) => summary.dead_lettered += 1,
		Ok(Ok((_, EventOutcome::RetryScheduled { .. }))) => summary.retries += 1,
		Ok(Ok((_, EventOutcome::Released))) => {}
		Ok(Err(error)) if error.is_fatal() => {
			tracing::error!(%error, "queue failure, coordinator stopping");
			return Err(error);
		}
		Ok(Err(error)) => tracing::warn!(%error, "event processing failed"),
		Err(error) if error.is_cancelled() => {}
		Err(error) => tracing::error!(%error, "dispatch task panicked"),
	}
	Ok(())
}

/// 运行中的调度循环句柄。
pub struct CoordinatorHandle {
	shutdown: watch::Sender<Option<Duration>>,
	task: JoinHandle<Result<RunSummary, QueueError>>,
	default_grace: Duration,
}

impl CoordinatorHandle {
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	/// 按配置的宽限期关闭。
	pub async fn stop(self) -> Result<RunSummary, crate::TrackerError> {
		let grace = self.default_grace;
		self.shutdown(grace).await
	}

	/// 停止调度新事件，在途提交最多再等待 `grace`。
	pub async fn shutdown(self, grace: Duration) -> Result<RunSummary, crate::TrackerError> {
		let _ = self.shutdown.send(Some(grace));
		Ok(self.task.await??)
	}
}
