//! Persisted configuration, read once per session start.
//!
//! The configuration file lives at `.provisioner/config.json`. A missing file
//! yields the defaults; a present but unparsable file is an error so a typo
//! never silently starts a session against the wrong pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use provision_core::{ResourceSpec, SessionParams};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_DIR: &str = ".provisioner";
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_PROVISIONING_URL: &str = "http://127.0.0.1:50325";

/// Fixed delays used by the engine, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTimings {
    /// Gap between launching consecutive workers
    pub worker_stagger_ms: u64,
    /// Wait before retrying when every resource is leased
    pub no_resource_delay_ms: u64,
    /// Backoff between failed rotation requests
    pub rotation_retry_ms: u64,
    /// Wait after a successful rotation before provisioning
    pub rotation_settle_ms: u64,
    /// Wait after a failed provisioning call
    pub provision_retry_ms: u64,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            worker_stagger_ms: 2_000,
            no_resource_delay_ms: 5_000,
            rotation_retry_ms: 30_000,
            rotation_settle_ms: 40_000,
            provision_retry_ms: 5_000,
        }
    }
}

impl EngineTimings {
    /// All delays zero; useful for embedding and tests.
    pub fn immediate() -> Self {
        Self {
            worker_stagger_ms: 0,
            no_resource_delay_ms: 0,
            rotation_retry_ms: 0,
            rotation_settle_ms: 0,
            provision_retry_ms: 0,
        }
    }

    pub fn worker_stagger(&self) -> Duration {
        Duration::from_millis(self.worker_stagger_ms)
    }

    pub fn no_resource_delay(&self) -> Duration {
        Duration::from_millis(self.no_resource_delay_ms)
    }

    pub fn rotation_retry(&self) -> Duration {
        Duration::from_millis(self.rotation_retry_ms)
    }

    pub fn rotation_settle(&self) -> Duration {
        Duration::from_millis(self.rotation_settle_ms)
    }

    pub fn provision_retry(&self) -> Duration {
        Duration::from_millis(self.provision_retry_ms)
    }
}

/// The part of the configuration the engine consumes at each start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    /// Parameters passed to every stage unless overridden at start
    #[serde(default)]
    pub default_params: SessionParams,
    #[serde(default)]
    pub timings: EngineTimings,
}

impl RunConfig {
    pub fn with_resources(mut self, resources: Vec<ResourceSpec>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_timings(mut self, timings: EngineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Validated pool contents. An empty list means a single direct resource.
    pub fn resource_pool(&self) -> Result<Vec<ResourceSpec>, ConfigError> {
        if self.resources.is_empty() {
            return Ok(vec![ResourceSpec::direct()]);
        }
        for (index, resource) in self.resources.iter().enumerate() {
            resource.validate(index)?;
        }
        Ok(self.resources.clone())
    }
}

/// One externally implemented stage, reached over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEndpoint {
    pub name: String,
    pub url: String,
}

/// Where the collaborator adapters live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provisioning_url: String,
    pub stages: Vec<StageEndpoint>,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provisioning_url: DEFAULT_PROVISIONING_URL.to_string(),
            stages: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Whole contents of `.provisioner/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(flatten)]
    pub run: RunConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl ProvisionerConfig {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Read the config file at `path`; a missing file yields the defaults.
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        debug!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    pub async fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).await.map_err(io_err)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        fs::write(path, content).await.map_err(io_err)?;
        debug!(path = %path.display(), "Config saved successfully");
        Ok(())
    }
}

/// Supplies the run configuration at every session start.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<RunConfig, ConfigError>;
}

/// Re-reads a JSON config file on every load.
#[derive(Debug, Clone)]
pub struct JsonFileConfig {
    path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for JsonFileConfig {
    async fn load(&self) -> Result<RunConfig, ConfigError> {
        Ok(ProvisionerConfig::read(&self.path).await?.run)
    }
}

/// Fixed in-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub RunConfig);

#[async_trait]
impl ConfigSource for StaticConfig {
    async fn load(&self) -> Result<RunConfig, ConfigError> {
        Ok(self.0.clone())
    }
}
