use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

/// One exclusive, rotatable resource from the configured pool.
///
/// Resources are identified by their index in the configured list; the
/// connection parameters are forwarded untouched to the provisioning
/// backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResourceSpec {
    /// Display name, falls back to `host:port` when empty
    #[serde(default)]
    pub name: String,
    /// Connection protocol (e.g. "http", "socks5")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Endpoint that triggers an out-of-band rotation of this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_url: Option<String>,
}

impl ResourceSpec {
    /// The implicit resource used when no pool is configured.
    pub fn direct() -> Self {
        Self {
            name: "direct".to_string(),
            ..Default::default()
        }
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rotation_url(mut self, url: impl Into<String>) -> Self {
        self.rotation_url = Some(url.into());
        self
    }

    pub fn can_rotate(&self) -> bool {
        self.rotation_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// `host:port`, or `None` for a direct resource.
    pub fn endpoint(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (Some(host), None) => Some(host.clone()),
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.endpoint().unwrap_or_else(|| "direct".to_string())
    }

    /// A resource with a port must also name its host.
    pub fn validate(&self, index: usize) -> Result<(), CoreError> {
        if self.port.is_some() && self.host.as_deref().map_or(true, str::is_empty) {
            return Err(CoreError::InvalidResource {
                index,
                reason: "port configured without host".to_string(),
            });
        }
        Ok(())
    }
}
