//! Broker configuration.
//!
//! Loaded from YAML files with `BROKER__`-prefixed environment overrides
//! (`BROKER__ENGINE__QUEUE_MAX_EVENTS=5000`). Durations are milliseconds.

mod endpoint;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use endpoint::{
    BbdoConfig, EndpointConfig, RetryConfig, TlsConfig, TransportConfig, TransportMode,
    TransportType,
};

use crate::catalogue::EventId;
use crate::events::storage;
use crate::multiplexing::EngineConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "broker.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BROKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BROKER_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Endpoint '{endpoint}': {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("Duplicate endpoint name: {0}")]
    DuplicateEndpoint(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Dimension mirror settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    /// `[category, element]` pairs to mirror.
    pub events: Vec<(u16, u16)>,
    /// Publish the loaded snapshot when the engine starts.
    pub republish: bool,
    /// Snapshot file name inside `cache_dir`.
    pub snapshot: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        let mapping = storage::METRIC_MAPPING;
        Self {
            enabled: true,
            events: vec![(mapping.category, mapping.element)],
            republish: false,
            snapshot: "mirror.snapshot".to_string(),
        }
    }
}

impl MirrorConfig {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events
            .iter()
            .map(|(category, element)| EventId::new(*category, *element))
            .collect()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    /// Directory for persistent queues and mirror snapshots.
    pub cache_dir: PathBuf,
    pub mirror: MirrorConfig,
    /// How long outputs may drain on shutdown before they are cut off.
    pub shutdown_timeout_ms: u64,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cache_dir: PathBuf::from("cache"),
            mirror: MirrorConfig::default(),
            shutdown_timeout_ms: 10_000,
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones winning: `broker.yaml` in the working directory,
    /// the file at `path`, the file named by `BROKER_CONFIG`, then
    /// `BROKER__*` variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without consulting files or the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config: Config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_endpoints(&self.endpoints)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }
}

/// Check every endpoint and that names are unique.
pub fn validate_endpoints(endpoints: &[EndpointConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for endpoint in endpoints {
        endpoint.validate()?;
        if !seen.insert(endpoint.name.as_str()) {
            return Err(ConfigError::DuplicateEndpoint(endpoint.name.clone()));
        }
    }
    Ok(())
}
