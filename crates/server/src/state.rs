use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use events::EventBus;
use orchestrator::SessionController;

use crate::routes::sse::{
    spawn_event_recorder, EventBuffer, SharedEventBuffer, DEFAULT_EVENT_BUFFER_SIZE,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
    pub event_bus: EventBus,
    pub event_buffer: SharedEventBuffer,
    pub app_dir: Option<PathBuf>,
}

impl AppState {
    /// Wrap `controller`; its event bus feeds the SSE endpoint.
    pub fn new(controller: Arc<SessionController>) -> Self {
        let event_bus = controller.event_bus().clone();
        let event_buffer = Arc::new(RwLock::new(EventBuffer::new(DEFAULT_EVENT_BUFFER_SIZE)));

        Self {
            controller,
            event_bus,
            event_buffer,
            app_dir: None,
        }
    }

    pub fn with_app_dir(mut self, app_dir: PathBuf) -> Self {
        self.app_dir = Some(app_dir);
        self
    }

    /// Start recording bus events for `Last-Event-ID` replay. Needs a Tokio
    /// runtime.
    pub fn record_events(self) -> Self {
        spawn_event_recorder(&self.event_bus, Arc::clone(&self.event_buffer));
        self
    }
}
