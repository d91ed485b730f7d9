pub mod error;
pub mod event;
pub mod id_generator;
pub mod logging;

pub use error::ModelError;
pub use event::{Backend, EventId, EventStatus, MetricEvent, MetricKind};
pub use id_generator::IdGenerator;
pub use logging::{init_logging, parse_level};
