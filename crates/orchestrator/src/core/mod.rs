//! Execution model of a session run.
//!
//! - [`RunState`] - Counters, logs and cancellation for one run
//! - [`AttemptPipeline`] - Rotate, provision, stages, finalize for one slot
//! - [`Worker`] - Sequential loop claiming slots and resources

mod pipeline;
mod run_state;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{AttemptPipeline, SlotReport};
pub use run_state::{RunState, SharedSettings};
pub use worker::Worker;
