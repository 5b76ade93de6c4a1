use async_trait::async_trait;
use provision_core::ResourceSpec;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::ProvisionError;
use crate::services::collaborators::{
    ContextId, ExecutionHandle, ProvisionOptions, ProvisioningClient,
};

/// Provisioning backend reached over a small JSON API:
///
/// - `POST   {base}/contexts`             → `{"id": "..."}`
/// - `POST   {base}/contexts/{id}/open`   → `{"endpoint": "...", "data": {...}}`
/// - `POST   {base}/contexts/{id}/close`
/// - `DELETE {base}/contexts/{id}`
///
/// Any body may carry `{"success": false, "error": "..."}` to signal failure
/// with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProvisioningClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    label: &'a str,
    visible: bool,
    resource: &'a ResourceSpec,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct OpenResponse {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

impl HttpProvisioningClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn context_url(&self, context: &ContextId, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{}/contexts/{}/{}", self.base_url, context, action),
            None => format!("{}/contexts/{}", self.base_url, context),
        }
    }

    /// Read the body, failing on a non-2xx status or an explicit
    /// `success: false`.
    async fn checked_body(response: Response) -> Result<String, String> {
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, truncate(&body)));
        }

        if let Ok(Status {
            success: false,
            error,
        }) = serde_json::from_str::<Status>(&body)
        {
            return Err(error.unwrap_or_else(|| "backend reported failure".to_string()));
        }

        Ok(body)
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn create(
        &self,
        resource: &ResourceSpec,
        options: &ProvisionOptions,
    ) -> Result<ContextId, ProvisionError> {
        let url = format!("{}/contexts", self.base_url);
        debug!(url = %url, resource = %resource.display_name(), "Creating execution context");

        let request = CreateRequest {
            label: &options.label,
            visible: options.visible,
            resource,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Failed to reach provisioning backend");
                ProvisionError::Create(e.to_string())
            })?;

        let body = Self::checked_body(response)
            .await
            .map_err(ProvisionError::Create)?;

        let created: CreateResponse = serde_json::from_str(&body)
            .map_err(|e| ProvisionError::Create(format!("unexpected response: {}", e)))?;

        Ok(ContextId::new(created.id))
    }

    async fn open(&self, context: &ContextId) -> Result<ExecutionHandle, ProvisionError> {
        let open_err = |reason: String| ProvisionError::Open {
            context: context.to_string(),
            reason,
        };

        let response = self
            .client
            .post(self.context_url(context, Some("open")))
            .send()
            .await
            .map_err(|e| open_err(e.to_string()))?;

        let body = Self::checked_body(response).await.map_err(open_err)?;
        let opened: OpenResponse = serde_json::from_str(&body)
            .map_err(|e| open_err(format!("unexpected response: {}", e)))?;

        Ok(ExecutionHandle {
            context_id: context.clone(),
            endpoint: opened.endpoint,
            data: opened.data,
        })
    }

    async fn close(&self, context: &ContextId) -> Result<(), ProvisionError> {
        let close_err = |reason: String| ProvisionError::Close {
            context: context.to_string(),
            reason,
        };

        let response = self
            .client
            .post(self.context_url(context, Some("close")))
            .send()
            .await
            .map_err(|e| close_err(e.to_string()))?;

        Self::checked_body(response).await.map_err(close_err)?;
        Ok(())
    }

    async fn destroy(&self, context: &ContextId) -> Result<(), ProvisionError> {
        let destroy_err = |reason: String| ProvisionError::Destroy {
            context: context.to_string(),
            reason,
        };

        let response = self
            .client
            .delete(self.context_url(context, None))
            .send()
            .await
            .map_err(|e| destroy_err(e.to_string()))?;

        Self::checked_body(response).await.map_err(destroy_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> ProvisionOptions {
        ProvisionOptions {
            visible: false,
            label: "slot-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_posts_resource_and_visibility() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts"))
            .and(body_partial_json(json!({
                "label": "slot-1",
                "visible": false,
                "resource": {"host": "10.0.0.7", "port": 3128}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "ctx-1"})))
            .mount(&server)
            .await;

        let client = HttpProvisioningClient::new(Client::new(), format!("{}/", server.uri()));
        let id = client
            .create(&ResourceSpec::new("10.0.0.7", 3128), &options())
            .await
            .unwrap();

        assert_eq!(id.as_str(), "ctx-1");
    }

    #[tokio::test]
    async fn test_create_maps_explicit_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "quota reached"})),
            )
            .mount(&server)
            .await;

        let client = HttpProvisioningClient::new(Client::new(), server.uri());
        let err = client
            .create(&ResourceSpec::direct(), &options())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Create(ref reason) if reason == "quota reached"));
    }

    #[tokio::test]
    async fn test_open_returns_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts/ctx-2/open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "endpoint": "ws://127.0.0.1:9222/devtools",
                "data": {"pid": 4242}
            })))
            .mount(&server)
            .await;

        let client = HttpProvisioningClient::new(Client::new(), server.uri());
        let handle = client.open(&ContextId::new("ctx-2")).await.unwrap();

        assert_eq!(handle.context_id.as_str(), "ctx-2");
        assert_eq!(handle.endpoint.as_deref(), Some("ws://127.0.0.1:9222/devtools"));
        assert_eq!(handle.data["pid"], 4242);
    }

    #[tokio::test]
    async fn test_open_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts/ctx-3/open"))
            .respond_with(ResponseTemplate::new(503).set_body_string("backend busy"))
            .mount(&server)
            .await;

        let client = HttpProvisioningClient::new(Client::new(), server.uri());
        let err = client.open(&ContextId::new("ctx-3")).await.unwrap_err();

        match err {
            ProvisionError::Open { context, reason } => {
                assert_eq!(context, "ctx-3");
                assert!(reason.contains("503"));
                assert!(reason.contains("backend busy"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_and_destroy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts/ctx-4/close"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/contexts/ctx-4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpProvisioningClient::new(Client::new(), server.uri());
        let id = ContextId::new("ctx-4");
        client.close(&id).await.unwrap();
        client.destroy(&id).await.unwrap();
    }
}
