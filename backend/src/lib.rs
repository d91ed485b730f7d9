pub mod adapters;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod submitter;

pub use adapters::{FaultScript, FsArchive, MemoryArchive, MemoryLedger, ScriptedArchive, ScriptedLedger, Step};
pub use error::SubmitFailure;
pub use payload::ArchivePayload;
pub use protocol::{
    ArchiveBackend, ArchiveReceipt, ContentId, IdempotencyKey, LedgerBackend, LedgerEntry,
    LedgerReceipt,
};
pub use submitter::{Ack, ArchiveSubmitter, LedgerSubmitter};
