//! 运行时：配置、重试策略、提交协调器与 `Tracker` 门面。

mod config;
mod coordinator;
mod retry;
mod tracker;

pub use config::{ArchiveConfig, ConfigError, CoordinatorConfig, LedgerConfig, LogConfig, TrackerConfig};
pub use coordinator::{CoordinatorHandle, EventOutcome, RunSummary, SubmissionCoordinator};
pub use retry::RetryPolicy;
pub use tracker::{Tracker, TrackerError};
