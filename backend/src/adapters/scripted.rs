use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::SubmitFailure;
use crate::protocol::{
    ArchiveBackend, ArchiveReceipt, IdempotencyKey, LedgerBackend, LedgerEntry, LedgerReceipt,
};

/// 脚本中的一步：决定下一次调用的延迟与结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 延迟后转发给内部后端。
    Pass { after: Duration },
    /// 延迟后失败，请求未到达内部后端。
    Fail { after: Duration, failure: SubmitFailure },
    /// 请求已在内部后端生效，但调用方收到失败（模拟响应丢失）。
    LandThenFail { after: Duration, failure: SubmitFailure },
    /// 永不返回。
    Hang,
}

impl Step {
    pub fn pass() -> Self {
        Self::Pass { after: Duration::ZERO }
    }

    pub fn pass_after(ms: u64) -> Self {
        Self::Pass {
            after: Duration::from_millis(ms),
        }
    }

    pub fn fail(failure: SubmitFailure) -> Self {
        Self::Fail {
            after: Duration::ZERO,
            failure,
        }
    }

    pub fn transient(message: &str) -> Self {
        Self::fail(SubmitFailure::Transient(message.to_string()))
    }

    pub fn rejected(message: &str) -> Self {
        Self::fail(SubmitFailure::Rejected(message.to_string()))
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<Step>,
    calls: Vec<Instant>,
}

/// 故障注入脚本：按顺序消费步骤，耗尽后一律 `Step::pass()`。
#[derive(Debug, Default)]
pub struct FaultScript {
    state: Mutex<ScriptState>,
}

impl FaultScript {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                steps: steps.into_iter().collect(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn push(&self, step: Step) {
        if let Ok(mut state) = self.state.lock() {
            state.steps.push_back(step);
        }
    }

    /// 已发生的调用时刻。
    pub fn calls(&self) -> Vec<Instant> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().map(|state| state.calls.len()).unwrap_or(0)
    }

    fn next_step(&self) -> Step {
        match self.state.lock() {
            Ok(mut state) => {
                state.calls.push(Instant::now());
                state.steps.pop_front().unwrap_or_else(Step::pass)
            }
            Err(_) => Step::fail(SubmitFailure::Unknown("fault script lock poisoned".to_string())),
        }
    }
}

async fn play<T, F>(step: Step, forward: F) -> Result<T, SubmitFailure>
where
    F: std::future::Future<Output = Result<T, SubmitFailure>>,
{
    match step {
        Step::Pass { after } => {
            tokio::time::sleep(after).await;
            forward.await
        }
        Step::Fail { after, failure } => {
            tokio::time::sleep(after).await;
            Err(failure)
        }
        Step::LandThenFail { after, failure } => {
            tokio::time::sleep(after).await;
            forward.await?;
            Err(failure)
        }
        Step::Hang => std::future::pending().await,
    }
}

/// 对任意账本后端注入延迟与故障；`lookup` 不受脚本影响。
pub struct ScriptedLedger<L> {
    inner: L,
    script: Arc<FaultScript>,
}

impl<L: LedgerBackend> ScriptedLedger<L> {
    pub fn new(inner: L, script: Arc<FaultScript>) -> Self {
        Self { inner, script }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn script(&self) -> &Arc<FaultScript> {
        &self.script
    }
}

#[async_trait]
impl<L: LedgerBackend> LedgerBackend for ScriptedLedger<L> {
    fn network(&self) -> &str {
        self.inner.network()
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<LedgerReceipt, SubmitFailure> {
        let step = self.script.next_step();
        play(step, self.inner.record(entry)).await
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<LedgerReceipt>, SubmitFailure> {
        self.inner.lookup(key).await
    }
}

/// 对任意归档后端注入延迟与故障。
pub struct ScriptedArchive<A> {
    inner: A,
    script: Arc<FaultScript>,
}

impl<A: ArchiveBackend> ScriptedArchive<A> {
    pub fn new(inner: A, script: Arc<FaultScript>) -> Self {
        Self { inner, script }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn script(&self) -> &Arc<FaultScript> {
        &self.script
    }
}

#[async_trait]
impl<A: ArchiveBackend> ArchiveBackend for ScriptedArchive<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, payload: &[u8]) -> Result<ArchiveReceipt, SubmitFailure> {
        let step = self.script.next_step();
        play(step, self.inner.put(payload)).await
    }
}
