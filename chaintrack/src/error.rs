use thiserror::Error;

use crate::event::{EventId, EventStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown metric kind: {0}")]
    InvalidKind(String),

    #[error("event {id} is already {status}, no further transition allowed")]
    TerminalStatus { id: EventId, status: EventStatus },

    #[error("worker id {0} out of range (max {max})", max = crate::id_generator::MAX_WORKER_ID)]
    WorkerIdOutOfRange(u64),

    #[error("system clock is before the id epoch")]
    ClockBeforeEpoch,

    #[error("id generator lock poisoned")]
    GeneratorPoisoned,
}
