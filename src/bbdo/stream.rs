//! Event stream speaking BBDO over a byte stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::codec::{encode, Decoded, Decoder, FrameDecoder};
use super::control::Control;
use super::extension::ExtensionRegistry;
use super::{ProtocolError, DEFAULT_MAX_PAYLOAD};
use crate::catalogue::{Catalogue, Event};
use crate::stream::prefixed::PrefixedStream;
use crate::stream::{
    ByteConnector, ByteStream, Connector, EventStream, Received, Result, Stream, StreamError,
    StreamStats,
};

/// Which side of a connection this stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; speaks first during negotiation.
    First,
    /// Accepted the connection; answers the peer's version response.
    Second,
}

#[derive(Debug, Clone)]
pub struct BbdoOptions {
    /// Skip negotiation and acknowledgements entirely. Configured
    /// extensions are applied unconditionally.
    pub coarse: bool,
    /// Send an ack after this many received events.
    pub ack_limit: u32,
    /// Relay events without a local schema as opaque payloads.
    pub relay_unknown: bool,
    pub max_payload: usize,
    pub negotiation_timeout: Duration,
    pub extensions: ExtensionRegistry,
}

impl Default for BbdoOptions {
    fn default() -> Self {
        Self {
            coarse: false,
            ack_limit: 1000,
            relay_unknown: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
            negotiation_timeout: Duration::from_secs(10),
            extensions: ExtensionRegistry::default(),
        }
    }
}

pub struct BbdoStream {
    name: String,
    inner: ByteStream,
    role: Role,
    options: BbdoOptions,
    decoder: Decoder,
    framer: FrameDecoder,
    unacked: u32,
    acknowledged: u64,
    stopped: bool,
    stats: StreamStats,
}

impl BbdoStream {
    /// Wrap `inner` and run negotiation (unless coarse).
    pub async fn open(
        inner: ByteStream,
        catalogue: Arc<Catalogue>,
        options: BbdoOptions,
        role: Role,
    ) -> Result<Self> {
        let mut stream = Self::new(inner, catalogue, options, role);
        if stream.options.coarse {
            for extension in stream.options.extensions.all() {
                stream.apply(extension.as_ref()).await?;
            }
        } else {
            stream.negotiate().await?;
        }
        Ok(stream)
    }

    fn new(inner: ByteStream, catalogue: Arc<Catalogue>, options: BbdoOptions, role: Role) -> Self {
        let name = format!("bbdo({})", inner.name());
        Self {
            stats: StreamStats::new(name.clone()),
            name,
            inner,
            role,
            decoder: Decoder::new(catalogue).relay_unknown(options.relay_unknown),
            framer: FrameDecoder::new(options.max_payload),
            options,
            unacked: 0,
            acknowledged: 0,
            stopped: false,
        }
    }

    /// Peer acknowledgements received since the last call.
    pub fn take_acknowledged(&mut self) -> u64 {
        std::mem::take(&mut self.acknowledged)
    }

    /// Send an acknowledgement for every event received so far.
    pub async fn acknowledge(&mut self) -> Result<()> {
        if self.options.coarse || self.unacked == 0 {
            return Ok(());
        }
        let count = std::mem::take(&mut self.unacked);
        self.inner.write(Control::Ack { count }.encode()).await?;
        self.inner.flush().await
    }

    async fn negotiate(&mut self) -> Result<()> {
        let ours = Control::version_response(self.options.extensions.advertised());
        let peer_extensions = match self.role {
            Role::First => {
                self.send_control(&ours).await?;
                self.await_version().await?
            }
            Role::Second => {
                let peer = self.await_version().await?;
                self.send_control(&ours).await?;
                peer
            }
        };
        let selected = self.options.extensions.negotiate(&peer_extensions);
        info!(
            stream = %self.name,
            peer_extensions = %peer_extensions,
            applied = selected.len(),
            "BBDO negotiation complete"
        );
        for extension in selected {
            self.apply(extension.as_ref()).await?;
        }
        Ok(())
    }

    /// Wrap the byte stream in `extension`. Bytes the peer already sent
    /// for the new layer are replayed beneath it.
    async fn apply(&mut self, extension: &dyn super::Extension) -> Result<()> {
        let unread = self.framer.take_unread().ok_or_else(|| {
            ProtocolError::Negotiation(format!(
                "switching to {} inside a frame",
                extension.name()
            ))
        })?;
        let mut inner = std::mem::replace(&mut self.inner, Box::new(Detached));
        if !unread.is_empty() {
            debug!(
                stream = %self.name,
                extension = extension.name(),
                bytes = unread.len(),
                "Replaying early bytes beneath extension"
            );
            inner = Box::new(PrefixedStream::new(unread, inner));
        }
        self.inner = extension.wrap(inner, self.role).await?;
        debug!(stream = %self.name, extension = extension.name(), "Extension applied");
        Ok(())
    }

    async fn send_control(&mut self, control: &Control) -> Result<()> {
        self.inner.write(control.encode()).await?;
        self.inner.flush().await
    }

    /// Read frames until the peer's version response arrives.
    async fn await_version(&mut self) -> Result<String> {
        let deadline = tokio::time::Instant::now() + self.options.negotiation_timeout;
        loop {
            while let Some(frame) = self.framer.next_frame()? {
                match self.decoder.decode(&frame)? {
                    Decoded::Control(Control::VersionResponse {
                        version,
                        extensions,
                    }) => {
                        debug!(stream = %self.name, %version, "Peer version received");
                        return Ok(extensions);
                    }
                    other => {
                        return Err(ProtocolError::Negotiation(format!(
                            "expected version response, got {other:?}"
                        ))
                        .into())
                    }
                }
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return Err(ProtocolError::Negotiation("peer did not answer in time".into()).into());
            }
            match self.inner.read(left).await? {
                Received::Item(data) => self.framer.feed(&data),
                Received::WouldBlock => {}
                Received::EndOfStream => {
                    return Err(StreamError::Closed(format!(
                        "{} during negotiation",
                        self.name
                    )))
                }
            }
        }
    }

    /// Handle a control frame received after negotiation. Returns whether
    /// the peer asked to stop.
    async fn on_control(&mut self, control: Control) -> Result<bool> {
        match control {
            Control::Ack { count } => {
                self.acknowledged += u64::from(count);
                Ok(false)
            }
            Control::Stop => {
                debug!(stream = %self.name, "Peer sent stop");
                self.acknowledge().await?;
                Ok(true)
            }
            Control::VersionResponse { version, .. } => {
                debug!(stream = %self.name, %version, "Ignoring late version response");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Stream for BbdoStream {
    type Item = Arc<Event>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Arc<Event>>> {
        loop {
            if self.stopped {
                return Ok(Received::EndOfStream);
            }
            if let Some(frame) = self.framer.next_frame()? {
                let size = frame.payload.len() + super::HEADER_SIZE;
                match self.decoder.decode(&frame)? {
                    Decoded::Control(control) => {
                        self.stopped = self.on_control(control).await?;
                    }
                    Decoded::Event(event) => {
                        self.stats.record_in(size, 1);
                        self.unacked += 1;
                        if !self.options.coarse && self.unacked >= self.options.ack_limit {
                            self.acknowledge().await?;
                        }
                        return Ok(Received::Item(Arc::new(event)));
                    }
                }
                continue;
            }
            match self.inner.read(timeout).await? {
                Received::Item(data) => self.framer.feed(&data),
                Received::WouldBlock => return Ok(Received::WouldBlock),
                Received::EndOfStream => {
                    if !self.framer.is_idle() {
                        warn!(
                            stream = %self.name,
                            buffered = self.framer.buffered(),
                            "Input ended inside a frame"
                        );
                    }
                    return Ok(Received::EndOfStream);
                }
            }
        }
    }

    async fn write(&mut self, event: Arc<Event>) -> Result<()> {
        let frame = encode(&event)?;
        let size = frame.len();
        self.inner.write(frame).await?;
        self.stats.record_out(size, 1);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.options.coarse && !self.stopped {
            // Best effort: the peer may already be gone.
            if let Err(e) = self.send_control(&Control::Stop).await {
                debug!(stream = %self.name, error = %e, "Could not send stop");
            }
        }
        self.inner.close().await
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone().with_inner(self.inner.statistics())
    }
}

/// Placeholder while an extension takes ownership of the inner stream.
struct Detached;

#[async_trait]
impl Stream for Detached {
    type Item = Bytes;

    fn name(&self) -> &str {
        "detached"
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Received<Bytes>> {
        Err(StreamError::Closed("detached stream".into()))
    }

    async fn write(&mut self, _item: Bytes) -> Result<()> {
        Err(StreamError::Closed("detached stream".into()))
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn statistics(&self) -> StreamStats {
        StreamStats::new("detached")
    }
}

/// Opens BBDO event streams over a byte-level transport.
pub struct BbdoConnector {
    name: String,
    transport: Arc<dyn ByteConnector>,
    catalogue: Arc<Catalogue>,
    options: BbdoOptions,
}

impl BbdoConnector {
    pub fn new(
        transport: Arc<dyn ByteConnector>,
        catalogue: Arc<Catalogue>,
        options: BbdoOptions,
    ) -> Self {
        Self {
            name: format!("bbdo:{}", transport.name()),
            transport,
            catalogue,
            options,
        }
    }
}

#[async_trait]
impl Connector for BbdoConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<EventStream> {
        let bytes = self.transport.open().await?;
        let stream = BbdoStream::open(
            bytes,
            self.catalogue.clone(),
            self.options.clone(),
            Role::First,
        )
        .await?;
        Ok(Box::new(stream))
    }
}
