//! TLS over any byte stream.
//!
//! `rustls` runs sans-I/O: ciphertext is pumped between the connection
//! state machine and the inner [`ByteStream`] by hand, so the same code
//! works over TCP, in-memory pipes or anything else. The handshake
//! completes before the first plaintext byte is exchanged.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use super::{ByteStream, Received, Result, Stream, StreamError, StreamStats};

const PLAINTEXT_CHUNK: usize = 16 * 1024;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration trusting the PEM certificates in `ca_pem`.
pub fn client_config(ca_pem: &[u8]) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem) {
        let cert = cert.map_err(|e| StreamError::Tls(format!("invalid CA certificate: {e}")))?;
        roots.add(cert)?;
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server configuration presenting the PEM chain `cert_pem` with `key_pem`.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StreamError::Tls(format!("invalid certificate: {e}")))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| StreamError::Tls(format!("invalid private key: {e}")))?;
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

pub struct TlsStream {
    name: String,
    inner: ByteStream,
    conn: Connection,
    plain: BytesMut,
    handshaken: bool,
    handshake_timeout: Duration,
    peer_closed: bool,
    stats: StreamStats,
}

impl TlsStream {
    /// Client side, verifying the peer against `server_name`.
    pub fn client(inner: ByteStream, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| StreamError::Config(format!("invalid TLS server name '{server_name}': {e}")))?;
        let conn = ClientConnection::new(config, server_name)?;
        Ok(Self::new(inner, Connection::Client(conn)))
    }

    pub fn server(inner: ByteStream, config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self::new(inner, Connection::Server(conn)))
    }

    fn new(inner: ByteStream, conn: Connection) -> Self {
        let name = format!("tls({})", inner.name());
        Self {
            stats: StreamStats::new(name.clone()),
            name,
            inner,
            conn,
            plain: BytesMut::new(),
            handshaken: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_closed: false,
        }
    }

    /// Upper bound for a handshake started implicitly by `write`.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Drive the handshake to completion.
    pub async fn handshake(&mut self, timeout: Duration) -> Result<()> {
        if self.advance_handshake(timeout).await? {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out").into())
        }
    }

    /// Make handshake progress for up to `timeout`. Returns whether the
    /// handshake is complete; an unfinished handshake resumes on the next
    /// call.
    async fn advance_handshake(&mut self, timeout: Duration) -> Result<bool> {
        if self.handshaken {
            return Ok(true);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        while self.conn.is_handshaking() {
            self.send_pending().await?;
            if !self.conn.is_handshaking() {
                break;
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            match self.inner.read(left).await? {
                Received::Item(data) => self.absorb(&data)?,
                Received::WouldBlock => {}
                Received::EndOfStream => {
                    return Err(StreamError::Tls("peer closed during handshake".into()))
                }
            }
        }
        // Final handshake flight (client Finished, session tickets).
        self.send_pending().await?;
        self.handshaken = true;
        debug!(stream = %self.name, "TLS handshake complete");
        Ok(true)
    }

    /// Write every pending TLS record to the inner stream.
    async fn send_pending(&mut self) -> Result<()> {
        let mut wrote = false;
        while self.conn.wants_write() {
            let mut records = Vec::new();
            self.conn.write_tls(&mut records)?;
            if records.is_empty() {
                break;
            }
            self.inner.write(Bytes::from(records)).await?;
            wrote = true;
        }
        if wrote {
            self.inner.flush().await?;
        }
        Ok(())
    }

    /// Feed ciphertext to rustls and move decrypted data to `plain`.
    fn absorb(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            self.conn.read_tls(&mut data)?;
            self.conn.process_new_packets()?;
            self.drain_plaintext()?;
        }
        Ok(())
    }

    fn drain_plaintext(&mut self) -> Result<()> {
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.plain.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

}

#[async_trait]
impl Stream for TlsStream {
    type Item = Bytes;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Bytes>> {
        if !self.advance_handshake(timeout).await? {
            return Ok(Received::WouldBlock);
        }
        loop {
            if !self.plain.is_empty() {
                let data = self.plain.split().freeze();
                self.stats.record_in(data.len(), 0);
                return Ok(Received::Item(data));
            }
            if self.peer_closed {
                return Ok(Received::EndOfStream);
            }
            match self.inner.read(timeout).await? {
                Received::Item(data) => {
                    self.absorb(&data)?;
                    // Key updates and alerts may need an answer.
                    self.send_pending().await?;
                }
                Received::WouldBlock => return Ok(Received::WouldBlock),
                Received::EndOfStream => return Ok(Received::EndOfStream),
            }
        }
    }

    async fn write(&mut self, item: Bytes) -> Result<()> {
        if !self.handshaken {
            self.handshake(self.handshake_timeout).await?;
        }
        let mut rest = &item[..];
        while !rest.is_empty() {
            let n = self.conn.writer().write(rest)?;
            rest = &rest[n..];
            self.send_pending().await?;
        }
        self.stats.record_out(item.len(), 0);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.send_pending().await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.handshaken {
            self.conn.send_close_notify();
            self.send_pending().await?;
        }
        self.inner.close().await
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone().with_inner(self.inner.statistics())
    }
}
