//! Negotiable transport extensions.
//!
//! Each side advertises the extensions it supports in its version
//! response. The extensions both sides support are applied, in the local
//! registration order, by wrapping the byte stream beneath BBDO.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::{ClientConfig, ServerConfig};

use super::Role;
use crate::stream::compression::CompressionStream;
use crate::stream::tls::TlsStream;
use crate::stream::{ByteStream, Result, StreamError};

pub const COMPRESSION: &str = "COMPRESSION";
pub const TLS: &str = "TLS";

/// A byte-stream decorator that can be switched on during negotiation.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name advertised on the wire. Must not contain spaces.
    fn name(&self) -> &str;

    /// Wrap `inner`. `role` tells which side opened the connection.
    async fn wrap(&self, inner: ByteStream, role: Role) -> Result<ByteStream>;
}

/// Ordered set of locally supported extensions.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.extensions.iter().map(|e| e.name())).finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension. A second extension with the same name replaces
    /// the first.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> &mut Self {
        self.extensions.retain(|e| e.name() != extension.name());
        self.extensions.push(extension);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Space-separated list for the version response.
    pub fn advertised(&self) -> String {
        self.extensions
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Local extensions the peer also listed, in local order.
    pub fn negotiate(&self, peer: &str) -> Vec<Arc<dyn Extension>> {
        let offered: Vec<&str> = peer.split_whitespace().collect();
        self.extensions
            .iter()
            .filter(|e| offered.iter().any(|name| name.eq_ignore_ascii_case(e.name())))
            .cloned()
            .collect()
    }

    /// Every registered extension (coarse mode applies them unconditionally).
    pub fn all(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.clone()
    }
}

/// LZ4 chunk compression.
pub struct CompressionExtension {
    buffer_size: usize,
}

impl CompressionExtension {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

#[async_trait]
impl Extension for CompressionExtension {
    fn name(&self) -> &str {
        COMPRESSION
    }

    async fn wrap(&self, inner: ByteStream, _role: Role) -> Result<ByteStream> {
        Ok(Box::new(CompressionStream::new(inner, self.buffer_size)))
    }
}

/// TLS, client or server side depending on the connection role.
pub struct TlsExtension {
    client: Option<(Arc<ClientConfig>, String)>,
    server: Option<Arc<ServerConfig>>,
    handshake_timeout: Duration,
}

impl TlsExtension {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            client: None,
            server: None,
            handshake_timeout,
        }
    }

    /// Used when this side opened the connection.
    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: impl Into<String>) -> Self {
        self.client = Some((config, server_name.into()));
        self
    }

    /// Used when this side accepted the connection.
    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }
}

#[async_trait]
impl Extension for TlsExtension {
    fn name(&self) -> &str {
        TLS
    }

    async fn wrap(&self, inner: ByteStream, role: Role) -> Result<ByteStream> {
        let mut tls = match role {
            Role::First => {
                let (config, server_name) = self.client.as_ref().ok_or_else(|| {
                    StreamError::Config("TLS negotiated but no client configuration".into())
                })?;
                TlsStream::client(inner, config.clone(), server_name)?
            }
            Role::Second => {
                let config = self.server.as_ref().ok_or_else(|| {
                    StreamError::Config("TLS negotiated but no server certificate".into())
                })?;
                TlsStream::server(inner, config.clone())?
            }
        };
        tls.handshake(self.handshake_timeout).await?;
        Ok(Box::new(tls.with_handshake_timeout(self.handshake_timeout)))
    }
}
