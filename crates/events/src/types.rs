//! Event types pushed to control-channel subscribers

use chrono::{DateTime, Utc};
use provision_core::{LogEntry, ProgressSnapshot, SlotOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Bus-wide publish order, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Workers are being launched for a new session
    #[serde(rename = "session.started")]
    SessionStarted {
        session_id: Uuid,
        target_count: usize,
        workers: usize,
    },

    #[serde(rename = "session.stop_requested")]
    StopRequested { session_id: Uuid },

    /// All workers exited, or the supervisor failed (`fatal` is set)
    #[serde(rename = "session.finished")]
    SessionFinished {
        session_id: Uuid,
        success_count: usize,
        failed_count: usize,
        rotation_count: u64,
        fatal: Option<String>,
    },

    #[serde(rename = "slot.completed")]
    SlotCompleted {
        session_id: Uuid,
        slot: usize,
        outcome: SlotOutcome,
        attempts: u32,
    },

    #[serde(rename = "log.appended")]
    LogAppended { session_id: Uuid, entry: LogEntry },

    #[serde(rename = "progress.updated")]
    ProgressUpdated { snapshot: Box<ProgressSnapshot> },

    #[serde(rename = "settings.changed")]
    SettingsChanged { concurrency: u32, visible: bool },
}

impl Event {
    /// Wire name of the event, used as the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::SessionStarted { .. } => "session.started",
            Event::StopRequested { .. } => "session.stop_requested",
            Event::SessionFinished { .. } => "session.finished",
            Event::SlotCompleted { .. } => "slot.completed",
            Event::LogAppended { .. } => "log.appended",
            Event::ProgressUpdated { .. } => "progress.updated",
            Event::SettingsChanged { .. } => "settings.changed",
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::SessionStarted { session_id, .. }
            | Event::StopRequested { session_id }
            | Event::SessionFinished { session_id, .. }
            | Event::SlotCompleted { session_id, .. }
            | Event::LogAppended { session_id, .. } => Some(*session_id),
            Event::ProgressUpdated { snapshot } => snapshot.session_id,
            Event::SettingsChanged { .. } => None,
        }
    }
}
