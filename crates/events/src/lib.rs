//! Event system for the provisioner
//!
//! This crate provides the event bus and event types used to push session
//! progress to the control channel.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
