//! Interfaces of the external collaborators the engine drives.
//!
//! The engine never looks inside an [`ExecutionHandle`] beyond handing it to
//! stages, and treats every non-success stage outcome the same way for
//! budget purposes.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use provision_core::{ResourceSpec, SessionParams, StageOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProvisionError, RotationError};

/// Identifier of an execution context issued by the provisioning backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live handle on an opened execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub context_id: ContextId,
    /// Address stages use to drive the context, if the backend exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Backend-specific payload, passed through untouched
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ExecutionHandle {
    pub fn new(context_id: ContextId) -> Self {
        Self {
            context_id,
            endpoint: None,
            data: serde_json::Value::Null,
        }
    }
}

/// Per-attempt options for creating an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOptions {
    /// Run the context observably rather than hidden
    pub visible: bool,
    pub label: String,
}

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create(
        &self,
        resource: &ResourceSpec,
        options: &ProvisionOptions,
    ) -> Result<ContextId, ProvisionError>;

    async fn open(&self, context: &ContextId) -> Result<ExecutionHandle, ProvisionError>;

    async fn close(&self, context: &ContextId) -> Result<(), ProvisionError>;

    async fn destroy(&self, context: &ContextId) -> Result<(), ProvisionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated,
    /// The resource has no rotation capability; nothing was done
    Skipped,
}

#[async_trait]
pub trait RotationService: Send + Sync {
    async fn rotate(&self, resource: &ResourceSpec) -> Result<RotationOutcome, RotationError>;
}

/// What a stage sees besides the execution handle.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub session_id: Uuid,
    pub slot: usize,
    /// 1-based attempt number within the slot
    pub attempt: u32,
    pub resource_index: usize,
    pub params: SessionParams,
    /// Artifacts reported by the earlier stages of this attempt
    pub artifacts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub outcome: StageOutcome,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl StageReport {
    pub fn success() -> Self {
        Self {
            outcome: StageOutcome::Success,
            detail: String::new(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn soft_fail(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::SoftFail,
            detail: detail.into(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn hard_fail(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::HardFail,
            detail: detail.into(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.artifacts.insert(key.into(), value.into());
        self
    }
}

/// One named step of the attempt pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, handle: &ExecutionHandle, ctx: &StageContext) -> StageReport;
}
