use async_trait::async_trait;
use provision_core::ResourceSpec;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::RotationError;
use crate::services::collaborators::{RotationOutcome, RotationService};

/// Triggers rotation by calling the resource's `rotation_url`.
///
/// The endpoint answers `{"success": true}` once the rotation has been
/// initiated; anything else is a failure whose `reason` (or `error`) is
/// reported. Resources without a rotation URL are skipped.
#[derive(Debug, Clone)]
pub struct HttpRotationService {
    client: Client,
}

#[derive(Deserialize)]
struct RotationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpRotationService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RotationService for HttpRotationService {
    async fn rotate(&self, resource: &ResourceSpec) -> Result<RotationOutcome, RotationError> {
        let Some(url) = resource.rotation_url.as_deref().filter(|_| resource.can_rotate()) else {
            return Ok(RotationOutcome::Skipped);
        };

        debug!(resource = %resource.display_name(), "Requesting rotation");

        let response = self
            .client
            .get(url.trim())
            .send()
            .await
            .map_err(|e| RotationError::Transport(e.to_string()))?;

        let status = response.status();
        let body: RotationResponse = response
            .json()
            .await
            .map_err(|e| RotationError::Rejected(format!("HTTP {}: {}", status, e)))?;

        if body.success {
            return Ok(RotationOutcome::Rotated);
        }

        let reason = body
            .reason
            .or(body.error)
            .unwrap_or_else(|| "Unknown error".to_string());
        Err(RotationError::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_resource_without_url_is_skipped() {
        let service = HttpRotationService::new(Client::new());
        let outcome = service.rotate(&ResourceSpec::direct()).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_successful_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reboot"))
            .and(query_param("token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let service = HttpRotationService::new(Client::new());
        let resource = ResourceSpec::new("10.0.0.1", 8000)
            .with_rotation_url(format!("{}/reboot?token=abc", server.uri()));

        assert_eq!(
            service.rotate(&resource).await.unwrap(),
            RotationOutcome::Rotated
        );
    }

    #[tokio::test]
    async fn test_rejected_rotation_reports_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reboot"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"success": false, "reason": "cooldown active"})),
            )
            .mount(&server)
            .await;

        let service = HttpRotationService::new(Client::new());
        let resource = ResourceSpec::direct().with_rotation_url(format!("{}/reboot", server.uri()));

        let err = service.rotate(&resource).await.unwrap_err();
        assert!(matches!(err, RotationError::Rejected(ref r) if r == "cooldown active"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let service = HttpRotationService::new(Client::new());
        let resource = ResourceSpec::direct().with_rotation_url(server.uri());

        let err = service.rotate(&resource).await.unwrap_err();
        assert!(matches!(err, RotationError::Rejected(ref r) if r.contains("502")));
    }
}
