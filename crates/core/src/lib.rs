pub mod domain;
pub mod error;

pub use domain::progress::{CompletedUnitRecord, LogEntry, LogLevel, ProgressSnapshot};
pub use domain::resource::ResourceSpec;
pub use domain::session::{
    clamp_concurrency, CommandAck, SessionParams, SlotOutcome, StageOutcome, MAX_CONCURRENCY,
    MAX_ROTATIONS_PER_SLOT, MIN_CONCURRENCY,
};
pub use error::CoreError;
