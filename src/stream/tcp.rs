//! TCP byte streams.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream as TokioTcpStream};
use tracing::{debug, info};

use super::{ByteConnector, ByteListener, ByteStream, Received, Result, Stream, StreamStats};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connected TCP socket carrying raw bytes.
pub struct TcpStream {
    name: String,
    socket: TokioTcpStream,
    buf: Vec<u8>,
    stats: StreamStats,
    eof: bool,
}

impl TcpStream {
    pub fn new(socket: TokioTcpStream) -> Self {
        let name = match socket.peer_addr() {
            Ok(peer) => format!("tcp({peer})"),
            Err(_) => "tcp".to_string(),
        };
        let _ = socket.set_nodelay(true);
        Self {
            stats: StreamStats::new(name.clone()),
            name,
            socket,
            buf: vec![0; READ_BUFFER_SIZE],
            eof: false,
        }
    }
}

#[async_trait]
impl Stream for TcpStream {
    type Item = Bytes;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Bytes>> {
        if self.eof {
            return Ok(Received::EndOfStream);
        }
        match tokio::time::timeout(timeout, self.socket.read(&mut self.buf)).await {
            Err(_) => Ok(Received::WouldBlock),
            Ok(Ok(0)) => {
                debug!(stream = %self.name, "Peer closed connection");
                self.eof = true;
                Ok(Received::EndOfStream)
            }
            Ok(Ok(n)) => {
                self.stats.record_in(n, 0);
                Ok(Received::Item(Bytes::copy_from_slice(&self.buf[..n])))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write(&mut self, item: Bytes) -> Result<()> {
        self.socket.write_all(&item).await?;
        self.stats.record_out(item.len(), 0);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.socket.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.socket.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone()
    }
}

/// Client side: connects to `host:port` on every `open`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    name: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        let host = host.into();
        Self {
            name: format!("tcp://{host}:{port}"),
            host,
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ByteConnector for TcpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<ByteStream> {
        let connect = TokioTcpStream::connect((self.host.as_str(), self.port));
        let socket = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.name),
                )
            })??;
        debug!(target = %self.name, "TCP connection established");
        Ok(Box::new(TcpStream::new(socket)))
    }
}

/// Server side: hands out one byte stream per accepted connection.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Listening for BBDO peers");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept_peer(&self) -> Result<(ByteStream, SocketAddr)> {
        let (socket, peer) = self.listener.accept().await?;
        Ok((Box::new(TcpStream::new(socket)), peer))
    }
}

#[async_trait]
impl ByteListener for TcpAcceptor {
    fn name(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp://{addr}"),
            Err(_) => "tcp://unbound".to_string(),
        }
    }

    async fn accept(&mut self) -> Result<Option<ByteStream>> {
        let (stream, peer) = self.accept_peer().await?;
        debug!(peer = %peer, "Accepted TCP peer");
        Ok(Some(stream))
    }
}
