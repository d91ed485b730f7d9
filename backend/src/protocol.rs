use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use chaintrack::EventId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SubmitFailure;

const LEDGER_KEY_DOMAIN: &str = "chaintrack/ledger/v1";

/// 由事件 ID 确定性派生的幂等键，同一事件重复提交得到同一个键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_event(id: EventId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(LEDGER_KEY_DOMAIN.as_bytes());
        hasher.update(id.0.to_be_bytes());
        Self(format!("0x{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 内容标识：`sha256:<hex>`，相同内容必然得到相同标识。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn of(payload: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(payload))))
    }

    pub fn parse(value: &str) -> Option<Self> {
        let digest = value.strip_prefix("sha256:")?;
        let valid = digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn digest(&self) -> &str {
        self.0.trim_start_matches("sha256:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: IdempotencyKey,
    pub metric: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub reference: String,
    /// 该键此前已记录过，本次提交没有产生新的效果。
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub cid: ContentId,
    pub duplicate: bool,
}

/// 账本后端（合约调用的抽象）。实现方应按幂等键去重。
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn network(&self) -> &str;

    async fn record(&self, entry: &LedgerEntry) -> Result<LedgerReceipt, SubmitFailure>;

    /// 提交前的幂等检查；不支持查询的后端返回 `None`。
    async fn lookup(&self, _key: &IdempotencyKey) -> Result<Option<LedgerReceipt>, SubmitFailure> {
        Ok(None)
    }
}

/// 内容寻址存储后端。
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, payload: &[u8]) -> Result<ArchiveReceipt, SubmitFailure>;
}
