pub mod fs_archive;
pub mod memory;
pub mod scripted;

pub use fs_archive::FsArchive;
pub use memory::{MemoryArchive, MemoryLedger};
pub use scripted::{FaultScript, ScriptedArchive, ScriptedLedger, Step};
