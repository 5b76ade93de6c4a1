//! RAII guard for provisioned execution contexts.
//!
//! Every context that was created is closed and destroyed exactly once,
//! whether the attempt finished, failed or unwound.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::services::{ContextId, ProvisioningClient};

/// Owns one execution context for the duration of an attempt.
///
/// Call [`ContextGuard::finalize`] on the normal path. If the guard is dropped
/// while still active (an early return or a panic), cleanup is spawned on the
/// current Tokio runtime instead.
pub struct ContextGuard {
    client: Arc<dyn ProvisioningClient>,
    context_id: ContextId,
    active: bool,
}

impl ContextGuard {
    pub fn new(client: Arc<dyn ProvisioningClient>, context_id: ContextId) -> Self {
        Self {
            client,
            context_id,
            active: true,
        }
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Close then destroy the context. Failures are logged, never returned:
    /// a context that cannot be torn down must not fail the attempt.
    pub async fn finalize(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        teardown(self.client.as_ref(), &self.context_id).await;
    }
}

async fn teardown(client: &dyn ProvisioningClient, context_id: &ContextId) {
    debug!(context = %context_id, "Finalizing execution context");

    if let Err(e) = client.close(context_id).await {
        warn!(context = %context_id, error = %e, "Failed to close execution context");
    }
    if let Err(e) = client.destroy(context_id).await {
        warn!(context = %context_id, error = %e, "Failed to destroy execution context");
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(context = %self.context_id, "No runtime available, execution context leaked");
            return;
        };

        let client = Arc::clone(&self.client);
        let context_id = self.context_id.clone();
        debug!(context = %context_id, "Spawning execution context cleanup");

        runtime.spawn(async move {
            teardown(client.as_ref(), &context_id).await;
        });
    }
}
