//! LZ4 compression beneath BBDO frames.
//!
//! Written bytes are buffered up to `buffer_size` and emitted as one
//! chunk: `u32 length` (big endian) followed by an LZ4 block with its
//! uncompressed size prepended. Chunk boundaries are independent of frame
//! boundaries.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use super::{ByteStream, Received, Result, Stream, StreamStats};
use crate::bbdo::ProtocolError;

/// Default amount of plaintext gathered before a chunk is emitted.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Largest chunk (compressed or not) accepted from a peer.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

pub struct CompressionStream {
    name: String,
    inner: ByteStream,
    buffer_size: usize,
    pending_out: BytesMut,
    pending_in: BytesMut,
    stats: StreamStats,
}

impl CompressionStream {
    pub fn new(inner: ByteStream, buffer_size: usize) -> Self {
        let name = format!("compression({})", inner.name());
        Self {
            stats: StreamStats::new(name.clone()),
            name,
            inner,
            buffer_size: buffer_size.max(1),
            pending_out: BytesMut::new(),
            pending_in: BytesMut::new(),
        }
    }

    async fn emit_chunk(&mut self) -> Result<()> {
        if self.pending_out.is_empty() {
            return Ok(());
        }
        let plain = self.pending_out.split();
        let compressed = compress_prepend_size(&plain);
        let mut chunk = BytesMut::with_capacity(4 + compressed.len());
        chunk.put_u32(compressed.len() as u32);
        chunk.extend_from_slice(&compressed);
        self.inner.write(chunk.freeze()).await
    }

    /// Next complete chunk from `pending_in`, decompressed.
    fn take_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pending_in.len() < 4 {
            return Ok(None);
        }
        let length = (&self.pending_in[..4]).get_u32() as usize;
        if length > MAX_CHUNK_SIZE {
            return Err(ProtocolError::TooLarge {
                length,
                max: MAX_CHUNK_SIZE,
            }
            .into());
        }
        if self.pending_in.len() < 4 + length {
            return Ok(None);
        }
        self.pending_in.advance(4);
        let compressed = self.pending_in.split_to(length);
        if compressed.len() < 4 {
            return Err(ProtocolError::Compression("chunk shorter than its size prefix".into()).into());
        }
        let declared = (&compressed[..4]).get_u32_le() as usize;
        if declared > MAX_CHUNK_SIZE {
            return Err(ProtocolError::TooLarge {
                length: declared,
                max: MAX_CHUNK_SIZE,
            }
            .into());
        }
        let plain = decompress_size_prepended(&compressed)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        Ok(Some(Bytes::from(plain)))
    }
}

#[async_trait]
impl Stream for CompressionStream {
    type Item = Bytes;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Bytes>> {
        loop {
            if let Some(plain) = self.take_chunk()? {
                self.stats.record_in(plain.len(), 0);
                return Ok(Received::Item(plain));
            }
            match self.inner.read(timeout).await? {
                Received::Item(data) => self.pending_in.extend_from_slice(&data),
                Received::WouldBlock => return Ok(Received::WouldBlock),
                Received::EndOfStream => return Ok(Received::EndOfStream),
            }
        }
    }

    async fn write(&mut self, item: Bytes) -> Result<()> {
        self.stats.record_out(item.len(), 0);
        self.pending_out.extend_from_slice(&item);
        if self.pending_out.len() >= self.buffer_size {
            self.emit_chunk().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.emit_chunk().await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner.close().await
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone().with_inner(self.inner.statistics())
    }
}
