//! In-process streams.
//!
//! [`pipe`] builds two connected ends of a bounded channel. Byte pipes
//! stand in for sockets; event pipes connect feeders directly. A
//! [`MemoryHub`] lets endpoints rendezvous by channel name the way TCP
//! peers rendezvous by address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ByteConnector, ByteListener, ByteStream, Received, Result, Stream, StreamError, StreamStats,
};
use crate::catalogue::Event;

/// Items a memory stream can account for in its statistics.
pub trait Measure {
    fn byte_len(&self) -> usize;
    fn event_count(&self) -> u64;
}

impl Measure for Bytes {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn event_count(&self) -> u64 {
        0
    }
}

impl Measure for Arc<Event> {
    fn byte_len(&self) -> usize {
        0
    }

    fn event_count(&self) -> u64 {
        1
    }
}

/// One end of an in-process pipe.
pub struct MemoryStream<T> {
    name: String,
    tx: Option<mpsc::Sender<T>>,
    rx: mpsc::Receiver<T>,
    stats: StreamStats,
}

/// Two connected ends: what one writes, the other reads.
pub fn pipe<T>(name: &str, capacity: usize) -> (MemoryStream<T>, MemoryStream<T>) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    let a = MemoryStream::new(format!("memory({name}):a"), a_tx, b_rx);
    let b = MemoryStream::new(format!("memory({name}):b"), b_tx, a_rx);
    (a, b)
}

impl<T> MemoryStream<T> {
    fn new(name: String, tx: mpsc::Sender<T>, rx: mpsc::Receiver<T>) -> Self {
        Self {
            stats: StreamStats::new(name.clone()),
            name,
            tx: Some(tx),
            rx,
        }
    }
}

#[async_trait]
impl<T> Stream for MemoryStream<T>
where
    T: Measure + Send + 'static,
{
    type Item = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<T>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(Received::WouldBlock),
            Ok(None) => Ok(Received::EndOfStream),
            Ok(Some(item)) => {
                self.stats.record_in(item.byte_len(), item.event_count());
                Ok(Received::Item(item))
            }
        }
    }

    async fn write(&mut self, item: T) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| StreamError::Closed(self.name.clone()))?;
        let (bytes, events) = (item.byte_len(), item.event_count());
        tx.send(item)
            .await
            .map_err(|_| StreamError::Closed(format!("peer of {}", self.name)))?;
        self.stats.record_out(bytes, events);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender is the peer's end-of-stream.
        self.tx = None;
        Ok(())
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone()
    }
}

// ============================================================================
// Named rendezvous
// ============================================================================

type PendingTx = mpsc::UnboundedSender<MemoryStream<Bytes>>;

/// Registry of named in-process listeners.
#[derive(Clone)]
pub struct MemoryHub {
    listeners: Arc<Mutex<HashMap<String, PendingTx>>>,
    capacity: usize,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            listeners: Arc::default(),
            capacity: 1024,
        }
    }

    /// Start accepting connections on `channel`, replacing any previous
    /// listener of the same name.
    pub fn listen(&self, channel: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(channel.to_string(), tx);
        debug!(channel, "Memory listener registered");
        MemoryListener {
            channel: channel.to_string(),
            rx,
        }
    }

    pub fn connect(&self, channel: &str) -> Result<MemoryStream<Bytes>> {
        let mut listeners = self.listeners.lock();
        let tx = listeners
            .get(channel)
            .ok_or_else(|| StreamError::Closed(format!("memory channel '{channel}'")))?;
        let (client, server) = pipe(channel, self.capacity);
        if tx.send(server).is_err() {
            listeners.remove(channel);
            return Err(StreamError::Closed(format!("memory channel '{channel}'")));
        }
        Ok(client)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept side of a hub channel.
pub struct MemoryListener {
    channel: String,
    rx: mpsc::UnboundedReceiver<MemoryStream<Bytes>>,
}

#[async_trait]
impl ByteListener for MemoryListener {
    fn name(&self) -> String {
        format!("memory://{}", self.channel)
    }

    /// Next connection, `None` once the hub is gone.
    async fn accept(&mut self) -> Result<Option<ByteStream>> {
        Ok(self
            .rx
            .recv()
            .await
            .map(|stream| Box::new(stream) as ByteStream))
    }
}

/// Connector opening byte streams on a hub channel.
#[derive(Clone)]
pub struct MemoryConnector {
    name: String,
    hub: MemoryHub,
    channel: String,
}

impl MemoryConnector {
    pub fn new(hub: MemoryHub, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self {
            name: format!("memory://{channel}"),
            hub,
            channel,
        }
    }
}

#[async_trait]
impl ByteConnector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<ByteStream> {
        Ok(Box::new(self.hub.connect(&self.channel)?))
    }
}
