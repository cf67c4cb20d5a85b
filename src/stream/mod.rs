//! Stream abstraction and composition.
//!
//! A [`Stream`] is one exclusively owned channel that moves items in
//! either direction. Byte streams ([`ByteStream`]) carry raw transport
//! data; event streams ([`EventStream`]) carry decoded events. Variants
//! are independent structs composed by explicit wrapping:
//!
//! ```text
//! FailoverStream
//!   └─ BbdoStream            events ⇄ frames
//!        └─ CompressionStream
//!             └─ TlsStream
//!                  └─ TcpStream | FileStream | MemoryStream
//! ```

pub mod compression;
pub mod failover;
pub mod file;
pub mod memory;
pub mod prefixed;
pub mod tcp;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::bbdo::{CodecError, ProtocolError};
use crate::catalogue::{Event, SchemaError};

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Stream of decoded events.
pub type EventStream = Box<dyn Stream<Item = Arc<Event>>>;

/// Stream of raw transport bytes.
pub type ByteStream = Box<dyn Stream<Item = Bytes>>;

/// Errors shared by every stream variant.
///
/// Decorators translate their inner stream's failures into this same
/// taxonomy so feeders can act on [`StreamError::disposition`] alone.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("subscriber '{0}' overflowed and was disconnected")]
    Overflow(String),

    #[error("multiplexing engine is not running")]
    NotRunning,

    #[error("shutdown in progress")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CodecError> for StreamError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Protocol(e) => StreamError::Protocol(e),
            CodecError::Schema(e) => StreamError::Schema(e),
        }
    }
}

impl From<rustls::Error> for StreamError {
    fn from(err: rustls::Error) -> Self {
        StreamError::Tls(err.to_string())
    }
}

/// What a feeder should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Close the transport, back off, reopen and retry the same item.
    Retry,
    /// Drop the offending item, log it and carry on.
    Skip,
    /// Give up on this endpoint and report to the supervisor.
    Fatal,
    /// Stop quietly: the process is shutting down.
    Shutdown,
}

impl StreamError {
    pub fn disposition(&self) -> Disposition {
        match self {
            StreamError::Protocol(_)
            | StreamError::Transport(_)
            | StreamError::Tls(_)
            | StreamError::Closed(_) => Disposition::Retry,
            StreamError::Schema(_) => Disposition::Skip,
            StreamError::Overflow(_) | StreamError::Config(_) => Disposition::Fatal,
            StreamError::NotRunning | StreamError::Shutdown => Disposition::Shutdown,
        }
    }

    /// Short error class used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Protocol(_) => "protocol",
            StreamError::Schema(_) => "schema",
            StreamError::Transport(_) => "transport",
            StreamError::Tls(_) => "tls",
            StreamError::Closed(_) => "closed",
            StreamError::Overflow(_) => "overflow",
            StreamError::NotRunning => "not_running",
            StreamError::Shutdown => "shutdown",
            StreamError::Config(_) => "config",
        }
    }
}

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Received<T> {
    Item(T),
    /// Nothing arrived before the timeout; the stream is still usable.
    WouldBlock,
    /// The peer closed or the source has no more data.
    EndOfStream,
}

impl<T> Received<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Received::Item(item) => Some(item),
            _ => None,
        }
    }
}

/// Statistics snapshot of a stream and, for decorators, of what it wraps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub name: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub events_in: u64,
    pub events_out: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub inner: Option<Box<StreamStats>>,
}

impl StreamStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_inner(mut self, inner: StreamStats) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn record_in(&mut self, bytes: usize, events: u64) {
        self.bytes_in += bytes as u64;
        self.events_in += events;
        self.last_activity = Some(Utc::now());
    }

    pub fn record_out(&mut self, bytes: usize, events: u64) {
        self.bytes_out += bytes as u64;
        self.events_out += events;
        self.last_activity = Some(Utc::now());
    }

    /// Innermost stats in the chain (the transport).
    pub fn transport(&self) -> &StreamStats {
        let mut current = self;
        while let Some(inner) = &current.inner {
            current = inner;
        }
        current
    }
}

/// One directional-or-bidirectional channel.
///
/// A stream is owned by exactly one feeder task; methods take `&mut self`
/// and are never called concurrently.
#[async_trait]
pub trait Stream: Send {
    type Item: Send;

    /// Human-readable name used in logs and statistics.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next item.
    async fn read(&mut self, timeout: Duration) -> Result<Received<Self::Item>>;

    async fn write(&mut self, item: Self::Item) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Flush and release the underlying resources.
    async fn close(&mut self) -> Result<()>;

    fn statistics(&self) -> StreamStats;
}

/// Opens fresh event streams for one endpoint recipe.
///
/// Feeders and [`failover::FailoverStream`] call `open` again after a
/// failure instead of trying to repair a broken stream.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<EventStream>;
}

/// Opens fresh byte streams (the transport part of a recipe).
#[async_trait]
pub trait ByteConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<ByteStream>;
}

/// Server side of a transport: yields one byte stream per peer.
#[async_trait]
pub trait ByteListener: Send {
    fn name(&self) -> String;

    /// Next connection, `None` once the listener is closed.
    async fn accept(&mut self) -> Result<Option<ByteStream>>;
}

#[cfg(test)]
mod tests;
