use super::compression::CompressionStream;
use super::failover::{Active, FailoverOptions, FailoverStream};
use super::file::{self, FileStream};
use super::memory::{self, MemoryHub};
use super::prefixed::PrefixedStream;
use super::tls::{self, TlsStream};
use super::*;
use crate::test_utils::{fast_backoff, host_status, test_catalogue, test_pki, MockConnector};
use std::sync::atomic::Ordering;

const TICK: Duration = Duration::from_millis(200);

async fn read_bytes(stream: &mut ByteStream, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < want {
        match stream.read(TICK).await.unwrap() {
            Received::Item(data) => out.extend_from_slice(&data),
            Received::WouldBlock => continue,
            Received::EndOfStream => break,
        }
    }
    out
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[test]
fn test_disposition_mapping() {
    let io = StreamError::Transport(std::io::Error::other("reset"));
    assert_eq!(io.disposition(), Disposition::Retry);
    assert_eq!(io.kind(), "transport");

    let schema = StreamError::Schema(SchemaError::Unknown(crate::catalogue::EventId::new(9, 9)));
    assert_eq!(schema.disposition(), Disposition::Skip);

    assert_eq!(StreamError::Shutdown.disposition(), Disposition::Shutdown);
    assert_eq!(StreamError::NotRunning.disposition(), Disposition::Shutdown);
    assert_eq!(
        StreamError::Overflow("out".into()).disposition(),
        Disposition::Fatal
    );
}

#[test]
fn test_codec_error_keeps_kind() {
    let err: StreamError = CodecError::Protocol(ProtocolError::TooLarge { length: 10, max: 1 }).into();
    assert!(matches!(err, StreamError::Protocol(ProtocolError::TooLarge { .. })));
}

#[test]
fn test_stats_transport_is_innermost() {
    let stats = StreamStats::new("outer").with_inner(StreamStats::new("middle").with_inner(StreamStats::new("tcp")));
    assert_eq!(stats.transport().name, "tcp");
}

// ============================================================================
// Memory
// ============================================================================

#[tokio::test]
async fn test_memory_pipe_roundtrip() {
    let (mut a, mut b) = memory::pipe::<Bytes>("t", 8);

    a.write(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(
        b.read(TICK).await.unwrap(),
        Received::Item(Bytes::from_static(b"hello"))
    );
    assert_eq!(b.read(Duration::from_millis(10)).await.unwrap(), Received::WouldBlock);

    a.close().await.unwrap();
    assert_eq!(b.read(TICK).await.unwrap(), Received::EndOfStream);
    assert!(a.write(Bytes::from_static(b"late")).await.is_err());

    assert_eq!(a.statistics().bytes_out, 5);
    assert_eq!(b.statistics().bytes_in, 5);
}

#[tokio::test]
async fn test_memory_hub_rendezvous() {
    let hub = MemoryHub::new();
    assert!(hub.connect("nowhere").is_err());

    let mut listener = hub.listen("broker");
    let mut client = hub.connect("broker").unwrap();
    let mut server = listener.accept().await.unwrap().unwrap();

    client.write(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(read_bytes(&mut server, 4).await, b"ping");
}

// ============================================================================
// File
// ============================================================================

#[tokio::test]
async fn test_file_stream_splits_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue");

    let mut writer = FileStream::open(&path, 10).await.unwrap();
    for chunk in [&b"aaaaaa"[..], b"bbbbbb", b"cccccc"] {
        writer.write(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    writer.close().await.unwrap();

    let splits = file::existing_splits(&path).await;
    assert_eq!(splits.len(), 3);
    assert_eq!(splits[1], file::split_path(&path, 1));

    let mut reader: ByteStream = Box::new(FileStream::open(&path, 10).await.unwrap());
    let data = read_bytes(&mut reader, 18).await;
    assert_eq!(data, b"aaaaaabbbbbbcccccc");
    assert_eq!(reader.read(TICK).await.unwrap(), Received::EndOfStream);

    file::remove_all(&path).await.unwrap();
    assert!(file::existing_splits(&path).await.is_empty());
}

#[tokio::test]
async fn test_file_stream_appends_to_last_split() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("log");

    let mut first = FileStream::open(&path, 0).await.unwrap();
    first.write(Bytes::from_static(b"one")).await.unwrap();
    first.close().await.unwrap();

    let mut second = FileStream::open(&path, 0).await.unwrap();
    second.write(Bytes::from_static(b"two")).await.unwrap();
    second.flush().await.unwrap();

    let mut reader: ByteStream = Box::new(FileStream::open(&path, 0).await.unwrap());
    assert_eq!(read_bytes(&mut reader, 6).await, b"onetwo");
}

// ============================================================================
// Compression
// ============================================================================

#[tokio::test]
async fn test_compression_roundtrip_across_chunks() {
    let (a, b) = memory::pipe::<Bytes>("z", 64);
    let mut writer = CompressionStream::new(Box::new(a), 16);
    let mut reader: ByteStream = Box::new(CompressionStream::new(Box::new(b), 16));

    let payload = b"host_status CRITICAL ".repeat(10);
    writer.write(Bytes::copy_from_slice(&payload[..100])).await.unwrap();
    writer.write(Bytes::copy_from_slice(&payload[100..])).await.unwrap();
    writer.flush().await.unwrap();

    assert_eq!(read_bytes(&mut reader, payload.len()).await, payload);

    let stats = writer.statistics();
    assert_eq!(stats.bytes_out, payload.len() as u64);
    // Repetitive input compresses
    assert!(stats.inner.unwrap().bytes_out < payload.len() as u64);
}

#[tokio::test]
async fn test_compression_buffers_until_flush() {
    let (a, mut b) = memory::pipe::<Bytes>("z", 8);
    let mut writer = CompressionStream::new(Box::new(a), 1024);

    writer.write(Bytes::from_static(b"small")).await.unwrap();
    assert_eq!(b.read(Duration::from_millis(20)).await.unwrap(), Received::WouldBlock);

    writer.flush().await.unwrap();
    assert!(matches!(b.read(TICK).await.unwrap(), Received::Item(_)));
}

#[tokio::test]
async fn test_compression_rejects_oversized_chunk() {
    let (mut raw, b) = memory::pipe::<Bytes>("z", 8);
    let mut reader = CompressionStream::new(Box::new(b), 16);

    raw.write(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF])).await.unwrap();
    let err = reader.read(TICK).await.unwrap_err();
    assert!(matches!(err, StreamError::Protocol(ProtocolError::TooLarge { .. })));
}

#[tokio::test]
async fn test_prefixed_stream_yields_prefix_first() {
    let (a, mut b) = memory::pipe::<Bytes>("p", 8);
    let mut stream = PrefixedStream::new(Bytes::from_static(b"early"), Box::new(a));

    b.write(Bytes::from_static(b"later")).await.unwrap();
    assert_eq!(
        stream.read(TICK).await.unwrap(),
        Received::Item(Bytes::from_static(b"early"))
    );
    assert_eq!(
        stream.read(TICK).await.unwrap(),
        Received::Item(Bytes::from_static(b"later"))
    );

    stream.write(Bytes::from_static(b"out")).await.unwrap();
    assert_eq!(
        b.read(TICK).await.unwrap(),
        Received::Item(Bytes::from_static(b"out"))
    );
}

// ============================================================================
// TLS
// ============================================================================

#[tokio::test]
async fn test_tls_over_memory_pipe() {
    let pki = test_pki();
    let client_config = tls::client_config(pki.ca_pem.as_bytes()).unwrap();
    let server_config = tls::server_config(pki.cert_pem.as_bytes(), pki.key_pem.as_bytes()).unwrap();

    let (a, b) = memory::pipe::<Bytes>("tls", 64);
    let mut client = TlsStream::client(Box::new(a), client_config, "localhost").unwrap();
    let mut server = TlsStream::server(Box::new(b), server_config).unwrap();

    let (client_done, server_done) = tokio::join!(
        client.handshake(Duration::from_secs(5)),
        server.handshake(Duration::from_secs(5))
    );
    client_done.unwrap();
    server_done.unwrap();

    client.write(Bytes::from_static(b"encrypted hello")).await.unwrap();
    client.flush().await.unwrap();

    let mut server: ByteStream = Box::new(server);
    assert_eq!(read_bytes(&mut server, 15).await, b"encrypted hello");

    // Ciphertext on the wire is not the plaintext
    let stats = client.statistics();
    assert_eq!(stats.bytes_out, 15);
    assert!(stats.inner.unwrap().bytes_out > 15);
}

#[tokio::test]
async fn test_tls_rejects_unknown_server_name() {
    let pki = test_pki();
    let client_config = tls::client_config(pki.ca_pem.as_bytes()).unwrap();
    let server_config = tls::server_config(pki.cert_pem.as_bytes(), pki.key_pem.as_bytes()).unwrap();

    let (a, b) = memory::pipe::<Bytes>("tls", 64);
    let mut client = TlsStream::client(Box::new(a), client_config, "not-the-broker").unwrap();
    let mut server = TlsStream::server(Box::new(b), server_config).unwrap();

    let (client_done, _) = tokio::join!(
        client.handshake(Duration::from_secs(2)),
        server.handshake(Duration::from_secs(2))
    );
    assert!(matches!(client_done, Err(StreamError::Tls(_))));
}

#[test]
fn test_tls_config_rejects_garbage() {
    assert!(tls::server_config(b"not a cert", b"not a key").is_err());
}

// ============================================================================
// Failover
// ============================================================================

fn failover_options() -> FailoverOptions {
    FailoverOptions {
        backoff: fast_backoff(2),
        primary_retry_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_failover_prefers_primary() {
    let primary = Arc::new(MockConnector::new("primary"));
    let secondary = Arc::new(MockConnector::new("secondary"));

    let stream = FailoverStream::open(primary.clone(), vec![secondary.clone()], failover_options())
        .await
        .unwrap();

    assert_eq!(stream.active(), Some(Active::Primary));
    assert_eq!(secondary.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failover_switches_to_secondary_and_back() {
    let catalogue = test_catalogue();
    let primary = Arc::new(MockConnector::new("primary"));
    let secondary = Arc::new(MockConnector::new("secondary"));
    primary.set_failing(true);

    let mut stream =
        FailoverStream::open(primary.clone(), vec![secondary.clone()], failover_options())
            .await
            .unwrap();
    assert_eq!(stream.active(), Some(Active::Secondary(0)));
    // Initial attempt plus two retries
    assert_eq!(primary.attempts.load(Ordering::SeqCst), 3);

    stream.write(host_status(&catalogue, 1, 0, "UP")).await.unwrap();
    assert_eq!(secondary.take_written().len(), 1);

    primary.set_failing(false);
    tokio::time::sleep(Duration::from_millis(60)).await;

    stream.write(host_status(&catalogue, 2, 0, "UP")).await.unwrap();
    assert_eq!(stream.active(), Some(Active::Primary));
    assert_eq!(primary.take_written().len(), 1);
}

#[tokio::test]
async fn test_failover_returns_to_primary_when_secondary_close_fails() {
    let catalogue = test_catalogue();
    let primary = Arc::new(MockConnector::new("primary"));
    let secondary = Arc::new(MockConnector::new("secondary"));
    primary.set_failing(true);
    secondary.set_fail_close(true);

    let mut stream =
        FailoverStream::open(primary.clone(), vec![secondary.clone()], failover_options())
            .await
            .unwrap();
    assert_eq!(stream.active(), Some(Active::Secondary(0)));

    primary.set_failing(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    stream.write(host_status(&catalogue, 3, 0, "UP")).await.unwrap();

    assert_eq!(stream.active(), Some(Active::Primary));
    assert_eq!(secondary.closed(), 1);
    assert_eq!(primary.take_written().len(), 1);
}

#[tokio::test]
async fn test_failover_fails_when_nothing_answers() {
    let primary = Arc::new(MockConnector::new("primary"));
    let secondary = Arc::new(MockConnector::new("secondary"));
    primary.set_failing(true);
    secondary.set_failing(true);

    let result = FailoverStream::open(primary, vec![secondary], failover_options()).await;
    assert!(matches!(result, Err(StreamError::Transport(_))));
}
