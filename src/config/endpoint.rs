//! Endpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::{ConfigError, Result};
use crate::bbdo::DEFAULT_MAX_PAYLOAD;
use crate::multiplexing::EventFilter;
use crate::processing::Direction;
use crate::stream::compression::DEFAULT_BUFFER_SIZE;

/// Transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Tcp,
    /// Split file set, always read and written without negotiation.
    File,
    /// In-process channel, mostly for tests and local relays.
    Memory,
}

/// Whether the broker dials out or waits for peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Connect,
    Listen,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    pub mode: TransportMode,
    /// TCP host to dial, or the bind address when listening.
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub path: Option<PathBuf>,
    /// Split size for file transports; 0 never splits.
    pub max_file_size: u64,
    /// Memory hub channel name.
    pub channel: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Tcp,
            mode: TransportMode::Connect,
            host: "127.0.0.1".to_string(),
            port: 5669,
            connect_timeout_ms: 5_000,
            path: None,
            max_file_size: 0,
            channel: String::new(),
        }
    }
}

impl TransportConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn is_listener(&self) -> bool {
        self.mode == TransportMode::Listen
    }

    fn validate(&self, endpoint: &str) -> Result<()> {
        let invalid = |reason: &str| ConfigError::Endpoint {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        match self.transport_type {
            TransportType::Tcp if self.host.is_empty() => Err(invalid("tcp transport needs a host")),
            TransportType::Tcp if self.port == 0 && !self.is_listener() => {
                Err(invalid("tcp transport needs a port"))
            }
            TransportType::File if self.path.is_none() => Err(invalid("file transport needs a path")),
            TransportType::File if self.is_listener() => {
                Err(invalid("file transport cannot listen"))
            }
            TransportType::Memory if self.channel.is_empty() => {
                Err(invalid("memory transport needs a channel"))
            }
            _ => Ok(()),
        }
    }
}

/// TLS settings. Connecting endpoints need `ca_file`, listening ones
/// `cert_file` and `key_file`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub server_name: String,
    pub handshake_timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            cert_file: None,
            key_file: None,
            server_name: "localhost".to_string(),
            handshake_timeout_ms: 10_000,
        }
    }
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// BBDO session options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BbdoConfig {
    pub coarse: bool,
    pub ack_limit: u32,
    pub relay_unknown: bool,
    pub max_payload: usize,
    pub negotiation_timeout_ms: u64,
    /// Offer the COMPRESSION extension.
    pub compression: bool,
    pub compression_buffer: usize,
}

impl Default for BbdoConfig {
    fn default() -> Self {
        Self {
            coarse: false,
            ack_limit: 1000,
            relay_unknown: true,
            max_payload: DEFAULT_MAX_PAYLOAD,
            negotiation_timeout_ms: 10_000,
            compression: false,
            compression_buffer: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_delay_ms: u64,
    /// Consecutive failures before the feeder gives up.
    pub max_attempts: usize,
    /// How often a failover stream tries to go back to the primary.
    pub primary_retry_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: 30_000,
            max_attempts: 20,
            primary_retry_interval_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn primary_retry_interval(&self) -> Duration {
        Duration::from_millis(self.primary_retry_interval_ms)
    }
}

/// One endpoint the broker feeds or reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub direction: Direction,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub bbdo: BbdoConfig,
    /// Secondary transports tried when the primary is unreachable.
    #[serde(default)]
    pub failover: Vec<TransportConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Events sent to an output, or accepted from an input.
    #[serde(default)]
    pub filter: EventFilter,
    /// Start output subscriptions at the oldest retained event.
    #[serde(default)]
    pub replay: bool,
    /// Keep unsent events in `<cache_dir>/<name>.queue` across restarts.
    #[serde(default)]
    pub persistent_queue: bool,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, direction: Direction, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            direction,
            transport,
            tls: None,
            bbdo: BbdoConfig::default(),
            failover: Vec::new(),
            retry: RetryConfig::default(),
            filter: EventFilter::default(),
            replay: false,
            persistent_queue: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ConfigError::Endpoint {
            endpoint: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        self.transport.validate(&self.name)?;
        for secondary in &self.failover {
            secondary.validate(&self.name)?;
            if secondary.is_listener() {
                return Err(invalid("failover transports must connect"));
            }
        }
        if self.transport.is_listener() {
            if !self.failover.is_empty() {
                return Err(invalid("listening endpoints cannot fail over"));
            }
            if self.persistent_queue {
                return Err(invalid("listening endpoints have no persistent queue"));
            }
        }
        if self.persistent_queue && self.direction == Direction::Input {
            return Err(invalid("input endpoints have no persistent queue"));
        }
        if let Some(tls) = &self.tls {
            if self.transport.transport_type == TransportType::File {
                return Err(invalid("file transports cannot use tls"));
            }
            if self.transport.is_listener() {
                if tls.cert_file.is_none() || tls.key_file.is_none() {
                    return Err(invalid("listening tls needs cert_file and key_file"));
                }
            } else if tls.ca_file.is_none() {
                return Err(invalid("connecting tls needs ca_file"));
            }
        }
        Ok(())
    }
}
