use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::services::collaborators::{ExecutionHandle, Stage, StageContext, StageReport};

/// A stage implemented by an external HTTP endpoint.
///
/// The endpoint receives the execution handle and stage context and answers
/// with a [`StageReport`]. An unreachable endpoint or a non-2xx status is a
/// soft failure; a body that cannot be decoded is a hard failure.
#[derive(Debug, Clone)]
pub struct WebhookStage {
    name: String,
    url: String,
    client: Client,
}

#[derive(Serialize)]
struct StageRequest<'a> {
    stage: &'a str,
    handle: &'a ExecutionHandle,
    #[serde(flatten)]
    context: &'a StageContext,
}

impl WebhookStage {
    pub fn new(client: Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Stage for WebhookStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, handle: &ExecutionHandle, ctx: &StageContext) -> StageReport {
        debug!(stage = %self.name, slot = ctx.slot, attempt = ctx.attempt, "Calling stage endpoint");

        let request = StageRequest {
            stage: &self.name,
            handle,
            context: ctx,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(stage = %self.name, error = %e, "Stage endpoint unreachable");
                return StageReport::soft_fail(format!("endpoint unreachable: {}", e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return StageReport::soft_fail(format!("endpoint returned HTTP {}", status));
        }

        match response.json::<StageReport>().await {
            Ok(report) => report,
            Err(e) => StageReport::hard_fail(format!("undecodable stage response: {}", e)),
        }
    }
}
