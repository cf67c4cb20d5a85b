//! Byte stream that yields already received bytes before reading on.
//!
//! Used when a peer's first bytes for a new layer (TLS records, compressed
//! chunks) arrived in the same read as the last negotiation frame.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteStream, Received, Result, Stream, StreamStats};

pub struct PrefixedStream {
    prefix: Option<Bytes>,
    inner: ByteStream,
}

impl PrefixedStream {
    pub fn new(prefix: Bytes, inner: ByteStream) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

#[async_trait]
impl Stream for PrefixedStream {
    type Item = Bytes;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Bytes>> {
        match self.prefix.take() {
            Some(prefix) => Ok(Received::Item(prefix)),
            None => self.inner.read(timeout).await,
        }
    }

    async fn write(&mut self, item: Bytes) -> Result<()> {
        self.inner.write(item).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn statistics(&self) -> StreamStats {
        self.inner.statistics()
    }
}
