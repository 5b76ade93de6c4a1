use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 10;

/// Rotations a single slot may consume before it is declared failed.
/// A slot therefore gets at most `MAX_ROTATIONS_PER_SLOT + 1` attempts.
pub const MAX_ROTATIONS_PER_SLOT: u32 = 20;

/// Clamp a requested worker count into `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
pub fn clamp_concurrency(requested: i64) -> u32 {
    requested.clamp(MIN_CONCURRENCY as i64, MAX_CONCURRENCY as i64) as u32
}

/// Free-form parameters handed to every stage of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionParams(BTreeMap<String, serde_json::Value>);

impl SessionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Layer `overrides` on top of `self`; keys in `overrides` win.
    pub fn merged(&self, overrides: &SessionParams) -> SessionParams {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        SessionParams(merged)
    }
}

/// Three-way result reported by a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    /// Retryable on a freshly rotated resource
    SoftFail,
    /// Unexpected defect; retried like a soft failure
    HardFail,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SoftFail => "soft_fail",
            Self::HardFail => "hard_fail",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Terminal state of one slot's attempt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlotOutcome {
    Succeeded,
    /// Rotation budget spent without a successful attempt
    Exhausted,
    /// Stopped by the user; counted neither as success nor failure
    Cancelled,
}

impl SlotOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Reply to a controller command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommandAck {
    pub accepted: bool,
    pub message: String,
}

impl CommandAck {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}
