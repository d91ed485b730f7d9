use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ModelError;
use crate::event::EventId;

const WORKER_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS;

pub const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;

// 2025-01-01T00:00:00Z
const EPOCH_MS: u64 = 1735689600000;

#[derive(Debug)]
struct Inner {
    sequence: u64,
    last_timestamp: u64,
}

/// snowflake 风格的事件 ID 生成器（时间戳 | worker | 序列号）。
///
/// 时钟回拨或序列号耗尽时借用下一毫秒，而不是忙等。
#[derive(Debug)]
pub struct IdGenerator {
    worker_id: u64,
    inner: Mutex<Inner>,
}

impl IdGenerator {
    pub fn new(worker_id: u64) -> Result<Self, ModelError> {
        if worker_id > MAX_WORKER_ID {
            return Err(ModelError::WorkerIdOutOfRange(worker_id));
        }
        Ok(Self {
            worker_id,
            inner: Mutex::new(Inner {
                sequence: 0,
                last_timestamp: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn next_id(&self) -> Result<EventId, ModelError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ModelError::GeneratorPoisoned)?;
        let mut ts = current_timestamp_ms()?;

        if ts <= guard.last_timestamp {
            ts = guard.last_timestamp;
            guard.sequence = (guard.sequence + 1) & MAX_SEQUENCE;
            if guard.sequence == 0 {
                ts += 1;
            }
        } else {
            guard.sequence = 0;
        }
        guard.last_timestamp = ts;

        Ok(EventId(
            ((ts - EPOCH_MS) << TIMESTAMP_SHIFT)
                | (self.worker_id << WORKER_ID_SHIFT)
                | guard.sequence,
        ))
    }

    /// 保证之后生成的 ID 严格大于 `seen`（恢复持久化队列后调用）。
    ///
    /// `seen` 可能来自其他 worker：worker 位高于本节点时，同一毫秒内的任何序列号都不够大，
    /// 必须推进到下一毫秒。
    pub fn fence(&self, seen: EventId) -> Result<(), ModelError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ModelError::GeneratorPoisoned)?;
        let ts = (seen.0 >> TIMESTAMP_SHIFT) + EPOCH_MS;
        let seen_worker = (seen.0 >> WORKER_ID_SHIFT) & MAX_WORKER_ID;
        // 记为"已发出"的最后位置；next_id 在其之后取号
        let sequence = if seen_worker > self.worker_id {
            MAX_SEQUENCE
        } else {
            seen.0 & MAX_SEQUENCE
        };
        if (ts, sequence) > (guard.last_timestamp, guard.sequence) {
            guard.last_timestamp = ts;
            guard.sequence = sequence;
        }
        Ok(())
    }
}

fn current_timestamp_ms() -> Result<u64, ModelError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ModelError::ClockBeforeEpoch)?
        .as_millis() as u64;
    if now < EPOCH_MS {
        return Err(ModelError::ClockBeforeEpoch);
    }
    Ok(now)
}
