pub mod collaborators;
pub mod http_provisioning;
pub mod http_rotation;
pub mod webhook_stage;

use std::sync::Arc;

use reqwest::{Client, Url};
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::ConfigError;

pub use collaborators::{
    ContextId, ExecutionHandle, ProvisionOptions, ProvisioningClient, RotationOutcome,
    RotationService, Stage, StageContext, StageReport,
};
pub use http_provisioning::HttpProvisioningClient;
pub use http_rotation::HttpRotationService;
pub use webhook_stage::WebhookStage;

/// The external collaborators a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn ProvisioningClient>,
    pub rotator: Arc<dyn RotationService>,
    /// Stages run in order on every attempt
    pub stages: Arc<[Arc<dyn Stage>]>,
}

impl Collaborators {
    pub fn new(
        provisioner: Arc<dyn ProvisioningClient>,
        rotator: Arc<dyn RotationService>,
        stages: Vec<Arc<dyn Stage>>,
    ) -> Self {
        Self {
            provisioner,
            rotator,
            stages: stages.into(),
        }
    }

    /// Build the HTTP adapters described by `backend`, sharing one client.
    pub fn from_backend(backend: &BackendConfig) -> Result<Self, ConfigError> {
        check_url(&backend.provisioning_url)?;
        for stage in &backend.stages {
            check_url(&stage.url)?;
        }

        let client = Client::builder()
            .timeout(backend.request_timeout())
            .build()
            .map_err(|e| ConfigError::Backend {
                url: backend.provisioning_url.clone(),
                reason: e.to_string(),
            })?;

        let stages: Vec<Arc<dyn Stage>> = backend
            .stages
            .iter()
            .map(|s| {
                Arc::new(WebhookStage::new(client.clone(), s.name.clone(), s.url.clone()))
                    as Arc<dyn Stage>
            })
            .collect();

        debug!(
            provisioning_url = %backend.provisioning_url,
            stage_count = stages.len(),
            "Collaborators configured"
        );

        Ok(Self::new(
            Arc::new(HttpProvisioningClient::new(
                client.clone(),
                backend.provisioning_url.clone(),
            )),
            Arc::new(HttpRotationService::new(client)),
            stages,
        ))
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }
}

fn check_url(url: &str) -> Result<(), ConfigError> {
    Url::parse(url).map(|_| ()).map_err(|e| ConfigError::Backend {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageEndpoint;

    #[test]
    fn test_from_backend_builds_stages_in_order() {
        let backend = BackendConfig {
            stages: vec![
                StageEndpoint {
                    name: "register".to_string(),
                    url: "http://127.0.0.1:9000/register".to_string(),
                },
                StageEndpoint {
                    name: "verify".to_string(),
                    url: "http://127.0.0.1:9000/verify".to_string(),
                },
            ],
            ..Default::default()
        };

        let collaborators = Collaborators::from_backend(&backend).unwrap();
        assert_eq!(collaborators.stage_names(), vec!["register", "verify"]);
    }

    #[test]
    fn test_from_backend_rejects_bad_url() {
        let backend = BackendConfig {
            provisioning_url: "not a url".to_string(),
            ..Default::default()
        };

        let err = Collaborators::from_backend(&backend).err().unwrap();
        assert!(matches!(err, ConfigError::Backend { ref url, .. } if url == "not a url"));
    }
}
