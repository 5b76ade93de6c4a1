//! RAII resource guards for automatic cleanup.
//!
//! - [`ResourceLease`] - Exclusive hold on a pool resource
//! - [`ContextGuard`] - Close and destroy of a provisioned execution context

mod context_guard;
mod lease;

pub use context_guard::ContextGuard;
pub use lease::{ResourceLease, ResourcePool};
