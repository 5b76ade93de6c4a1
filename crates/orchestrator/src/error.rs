use provision_core::{CoreError, StageOutcome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session not running")]
    NotRunning,

    #[error("Invalid session request: {0}")]
    InvalidRequest(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Stage {stage} reported {}: {detail}", outcome.as_str())]
    StageFailure {
        stage: String,
        outcome: StageOutcome,
        detail: String,
    },

    /// A collaborator panicked mid-attempt; retried like a hard failure.
    #[error("Attempt panicked: {0}")]
    AttemptPanicked(String),

    #[error("Rotation budget exhausted for slot {slot} after {attempts} attempts")]
    BudgetExhausted { slot: usize, attempts: u32 },

    #[error("Session fatal error: {0}")]
    SessionFatal(String),

    #[error("Cancellation requested")]
    Cancelled,
}

impl OrchestratorError {
    /// Create a stage failure error.
    pub fn stage_failed(
        stage: impl Into<String>,
        outcome: StageOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            outcome,
            detail: detail.into(),
        }
    }

    /// Whether this error is a controller rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::NotRunning | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure of the provisioning backend while managing an execution context.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to create execution context: {0}")]
    Create(String),

    #[error("Failed to open execution context {context}: {reason}")]
    Open { context: String, reason: String },

    #[error("Failed to close execution context {context}: {reason}")]
    Close { context: String, reason: String },

    #[error("Failed to destroy execution context {context}: {reason}")]
    Destroy { context: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("Rotation rejected: {0}")]
    Rejected(String),

    #[error("Rotation request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(#[from] CoreError),

    #[error("Invalid backend URL {url}: {reason}")]
    Backend { url: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_display() {
        let err = OrchestratorError::stage_failed("verify", StageOutcome::SoftFail, "timed out");
        assert_eq!(err.to_string(), "Stage verify reported soft_fail: timed out");
    }

    #[test]
    fn test_rejections() {
        assert!(OrchestratorError::AlreadyRunning.is_rejection());
        assert!(OrchestratorError::NotRunning.is_rejection());
        assert!(OrchestratorError::from(CoreError::InvalidTarget(0)).is_rejection());
        assert!(!OrchestratorError::SessionFatal("boom".into()).is_rejection());
    }

    #[test]
    fn test_budget_exhausted_display() {
        let err = OrchestratorError::BudgetExhausted {
            slot: 2,
            attempts: 21,
        };
        assert!(err.to_string().contains("slot 2"));
        assert!(err.to_string().contains("21 attempts"));
    }
}
