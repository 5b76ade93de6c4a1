use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    /// A step is about to start
    Action,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Action => "action",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        }
    }
}

/// Artifact produced by a slot whose pipeline ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CompletedUnitRecord {
    pub slot: usize,
    /// Execution context the unit was produced in
    pub context_id: String,
    pub resource_index: usize,
    pub resource_name: String,
    /// Attempts spent on the slot, including the successful one
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Identifiers and credentials reported by the stages
    pub artifacts: BTreeMap<String, String>,
    pub completed_at: DateTime<Utc>,
}

/// Read-only copy of a session's state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProgressSnapshot {
    pub session_id: Option<Uuid>,
    pub running: bool,
    pub cancel_requested: bool,
    pub target_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// `success_count + failed_count`
    pub attempt_count: usize,
    pub rotation_count: u64,
    pub concurrency: u32,
    pub active_workers: usize,
    pub visible: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub completed: Vec<CompletedUnitRecord>,
}

impl ProgressSnapshot {
    pub fn remaining(&self) -> usize {
        self.target_count.saturating_sub(self.attempt_count)
    }
}
