use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::SubmitFailure;
use crate::protocol::{
    ArchiveBackend, ArchiveReceipt, ContentId, IdempotencyKey, LedgerBackend, LedgerEntry,
    LedgerReceipt,
};

#[derive(Debug, Default)]
struct LedgerBook {
    receipts: HashMap<IdempotencyKey, String>,
    totals: BTreeMap<String, u64>,
    height: u64,
}

/// 内存账本：按幂等键去重，按指标名累计数值。
#[derive(Debug)]
pub struct MemoryLedger {
    network: String,
    book: Mutex<LedgerBook>,
}

impl MemoryLedger {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            book: Mutex::new(LedgerBook::default()),
        }
    }

    pub fn total(&self, metric: &str) -> u64 {
        self.book()
            .map(|book| book.totals.get(metric).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn totals(&self) -> BTreeMap<String, u64> {
        self.book().map(|book| book.totals.clone()).unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.book().map(|book| book.receipts.len()).unwrap_or(0)
    }

    fn book(&self) -> Result<MutexGuard<'_, LedgerBook>, SubmitFailure> {
        self.book
            .lock()
            .map_err(|_| SubmitFailure::Unknown("memory ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    fn network(&self) -> &str {
        &self.network
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<LedgerReceipt, SubmitFailure> {
        let mut book = self.book()?;
        if let Some(reference) = book.receipts.get(&entry.key) {
            return Ok(LedgerReceipt {
                reference: reference.clone(),
                duplicate: true,
            });
        }

        book.height += 1;
        let reference = format!("{}:{}", self.network, book.height);
        book.receipts.insert(entry.key.clone(), reference.clone());
        *book.totals.entry(entry.metric.clone()).or_default() += entry.value;
        Ok(LedgerReceipt {
            reference,
            duplicate: false,
        })
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<LedgerReceipt>, SubmitFailure> {
        let book = self.book()?;
        Ok(book.receipts.get(key).map(|reference| LedgerReceipt {
            reference: reference.clone(),
            duplicate: true,
        }))
    }
}

/// 内存内容寻址存储。
#[derive(Debug, Default)]
pub struct MemoryArchive {
    objects: Mutex<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cid: &ContentId) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(cid).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ArchiveBackend for MemoryArchive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, payload: &[u8]) -> Result<ArchiveReceipt, SubmitFailure> {
        let cid = ContentId::of(payload);
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| SubmitFailure::Unknown("memory archive lock poisoned".to_string()))?;
        let duplicate = objects.contains_key(&cid);
        if !duplicate {
            objects.insert(cid.clone(), payload.to_vec());
        }
        Ok(ArchiveReceipt { cid, duplicate })
    }
}
