pub mod config;
pub mod core;
pub mod error;
pub mod log_buffer;
pub mod resources;
pub mod services;
pub mod session;
pub mod slots;

pub use config::{
    BackendConfig, ConfigSource, EngineTimings, JsonFileConfig, ProvisionerConfig, RunConfig,
    StaticConfig,
};
pub use error::{ConfigError, OrchestratorError, ProvisionError, Result, RotationError};
pub use services::Collaborators;
pub use session::{effective_workers, SessionController};
