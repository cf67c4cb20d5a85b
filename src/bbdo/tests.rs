use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use super::*;
use crate::catalogue::{Event, SchemaError, Value};
use crate::events::{neb, storage};
use crate::stream::compression::CompressionStream;
use crate::stream::memory::{self, MemoryStream};
use crate::stream::{ByteStream, Received, Stream, StreamError};
use crate::test_utils::{host_status, test_catalogue};

const TICK: Duration = Duration::from_millis(200);

fn payload_of(frame: &Bytes) -> Bytes {
    frame.slice(HEADER_SIZE..)
}

fn decode_event(decoder: &Decoder, bytes: &[u8]) -> Event {
    match decoder.decode_bytes(bytes).unwrap() {
        Decoded::Event(event) => event,
        other => panic!("expected event, got {other:?}"),
    }
}

// ============================================================================
// Frames
// ============================================================================

#[test]
fn test_host_status_frame_layout() {
    let catalogue = test_catalogue();
    let event = host_status(&catalogue, 42, 2, "CRITICAL");
    let frame = encode(&event).unwrap();

    // host_id + state + string length + "CRITICAL"
    assert_eq!(frame.len(), HEADER_SIZE + 4 + 4 + 4 + 8);

    let mut framer = FrameDecoder::default();
    framer.feed(&frame);
    let decoded = framer.next_frame().unwrap().unwrap();
    assert_eq!(decoded.header.length, 20);
    assert_eq!(decoded.header.id, neb::HOST_STATUS);
    assert!(framer.is_idle());

    let decoder = Decoder::new(catalogue);
    assert_eq!(decoder.decode(&decoded).unwrap(), Decoded::Event((*event).clone()));
}

#[test]
fn test_routing_ids_survive() {
    let catalogue = test_catalogue();
    let event = (*host_status(&catalogue, 1, 0, "UP")).clone().with_routing(3, 9);
    let decoded = decode_event(&Decoder::new(catalogue), &encode(&event).unwrap());
    assert_eq!(decoded.source_id, 3);
    assert_eq!(decoded.destination_id, 9);
}

#[test]
fn test_corrupted_checksum_rejected() {
    let catalogue = test_catalogue();
    let mut frame = encode(&host_status(&catalogue, 42, 2, "CRITICAL"))
        .unwrap()
        .to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;

    let mut framer = FrameDecoder::default();
    framer.feed(&frame);
    let err = framer.next_frame().unwrap_err();
    assert!(matches!(err, ProtocolError::Corrupt { id, .. } if id == neb::HOST_STATUS));
}

#[test]
fn test_corrupt_frame_is_consumed() {
    let catalogue = test_catalogue();
    let mut bad = encode(&host_status(&catalogue, 1, 0, "UP")).unwrap().to_vec();
    bad[HEADER_SIZE] ^= 0x01;
    let good = encode(&host_status(&catalogue, 2, 0, "UP")).unwrap();

    let mut framer = FrameDecoder::default();
    framer.feed(&bad);
    framer.feed(&good);
    assert!(framer.next_frame().is_err());
    let frame = framer.next_frame().unwrap().unwrap();
    assert_eq!(frame.payload, payload_of(&good));
}

#[test]
fn test_byte_at_a_time_feeding() {
    let catalogue = test_catalogue();
    let first = encode(&host_status(&catalogue, 1, 0, "UP")).unwrap();
    let second = encode(&host_status(&catalogue, 2, 1, "DOWN")).unwrap();
    let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

    let mut framer = FrameDecoder::default();
    let mut frames = Vec::new();
    for byte in stream {
        framer.feed(&[byte]);
        if let Some(frame) = framer.next_frame().unwrap() {
            frames.push(frame);
        }
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].payload, payload_of(&first));
    assert_eq!(frames[1].payload, payload_of(&second));
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_oversized_frame_rejected() {
    let catalogue = test_catalogue();
    let frame = encode(&host_status(&catalogue, 42, 2, "CRITICAL")).unwrap();
    let mut framer = FrameDecoder::new(8);
    framer.feed(&frame);
    assert_eq!(
        framer.next_frame().unwrap_err(),
        ProtocolError::TooLarge { length: 20, max: 8 }
    );
}

// ============================================================================
// Payloads
// ============================================================================

#[test]
fn test_payload_ending_on_field_boundary_uses_defaults() {
    let catalogue = test_catalogue();
    let payload = encode_payload(&host_status(&catalogue, 42, 2, "CRITICAL")).unwrap();
    let frame = encode_frame(neb::HOST_STATUS, 0, 0, &payload[..4]);

    let event = decode_event(&Decoder::new(catalogue), &frame);
    assert_eq!(event.get("host_id").unwrap(), &Value::Int(42));
    assert_eq!(event.get("state").unwrap(), &Value::Int(0));
    assert_eq!(event.get("output").unwrap().as_str(), Some(""));
}

#[test]
fn test_partial_field_is_malformed() {
    let catalogue = test_catalogue();
    let payload = encode_payload(&host_status(&catalogue, 42, 2, "CRITICAL")).unwrap();
    let frame = encode_frame(neb::HOST_STATUS, 0, 0, &payload[..6]);

    let err = Decoder::new(catalogue).decode_bytes(&frame).unwrap_err();
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::Malformed { id, .. }) if id == neb::HOST_STATUS
    ));
}

#[test]
fn test_trailing_bytes_ignored() {
    let catalogue = test_catalogue();
    let event = host_status(&catalogue, 42, 2, "CRITICAL");
    let mut payload = encode_payload(&event).unwrap().to_vec();
    payload.extend_from_slice(&[1, 2, 3]);
    let frame = encode_frame(neb::HOST_STATUS, 0, 0, &payload);

    assert_eq!(decode_event(&Decoder::new(catalogue), &frame), *event);
}

#[test]
fn test_unknown_event_needs_relay() {
    let catalogue = test_catalogue();
    let id = crate::catalogue::EventId::new(9, 9);
    let frame = encode_frame(id, 0, 0, b"raw bytes");

    let strict = Decoder::new(catalogue.clone());
    assert_eq!(
        strict.decode_bytes(&frame).unwrap_err(),
        CodecError::Schema(SchemaError::Unknown(id))
    );

    let relay = Decoder::new(catalogue).relay_unknown(true);
    let event = decode_event(&relay, &frame);
    assert!(event.is_opaque());
    assert_eq!(encode(&event).unwrap(), frame);
}

#[test]
fn test_nested_events_and_local_fields() {
    let catalogue = test_catalogue();
    let metric = catalogue
        .create(storage::METRIC)
        .unwrap()
        .with("metric_id", 5u32)
        .unwrap()
        .with("value", 0.5f64)
        .unwrap()
        .with("name", "rta")
        .unwrap();
    let rebuild = catalogue
        .create(storage::REBUILD)
        .unwrap()
        .with("id", 77u32)
        .unwrap()
        .with("metrics", vec![Arc::new(metric)])
        .unwrap();

    let decoded = decode_event(&Decoder::new(catalogue), &encode(&rebuild).unwrap());
    assert_eq!(decoded.get("id").unwrap(), &Value::UInt(77));
    let Value::Events(nested) = decoded.get("metrics").unwrap() else {
        panic!("metrics is not a nested list");
    };
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].get("value").unwrap(), &Value::Double(0.5));
    // Local fields never travel
    assert_eq!(nested[0].get("name").unwrap().as_str(), Some(""));
}

/// A `rebuild` payload whose `metrics` list holds another `rebuild`,
/// `levels` times over. Written front to back so arbitrary depths stay cheap.
fn nested_rebuild_payload(levels: usize) -> Vec<u8> {
    const FIELDS: usize = 6;
    const LINK: usize = 4 + 8;
    let mut payload = Vec::with_capacity(FIELDS + levels * (FIELDS + LINK));
    for level in (1..=levels).rev() {
        payload.push(0);
        payload.extend_from_slice(&(level as u32).to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&storage::REBUILD.category.to_be_bytes());
        payload.extend_from_slice(&storage::REBUILD.element.to_be_bytes());
        let inner = FIELDS + (level - 1) * (FIELDS + LINK);
        payload.extend_from_slice(&(inner as u32).to_be_bytes());
    }
    payload.push(1);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.push(0);
    payload
}

#[test]
fn test_nesting_within_bound_decodes() {
    let catalogue = test_catalogue();
    let frame = encode_frame(
        storage::REBUILD,
        0,
        0,
        &nested_rebuild_payload(MAX_NESTING_DEPTH),
    );

    let mut event = decode_event(&Decoder::new(catalogue), &frame);
    for _ in 0..MAX_NESTING_DEPTH {
        let Value::Events(nested) = event.get("metrics").unwrap().clone() else {
            panic!("metrics is not a nested list");
        };
        assert_eq!(nested.len(), 1);
        event = (*nested[0]).clone();
    }
    assert_eq!(event.get("end").unwrap(), &Value::Bool(true));
}

#[test]
fn test_deeply_nested_events_rejected() {
    let catalogue = test_catalogue();
    let payload = nested_rebuild_payload(50_000);
    assert!(payload.len() < DEFAULT_MAX_PAYLOAD);
    let frame = encode_frame(storage::REBUILD, 0, 0, &payload);

    let err = Decoder::new(catalogue).decode_bytes(&frame).unwrap_err();
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::Malformed { id, .. }) if id == storage::REBUILD
    ));
}

// ============================================================================
// Control frames
// ============================================================================

#[test]
fn test_control_frames_decode() {
    let decoder = Decoder::new(test_catalogue());
    for control in [
        Control::version_response("COMPRESSION TLS"),
        Control::Ack { count: 7 },
        Control::Stop,
    ] {
        assert_eq!(
            decoder.decode_bytes(&control.encode()).unwrap(),
            Decoded::Control(control)
        );
    }
}

#[test]
fn test_version_major_mismatch_rejected() {
    let payload = [0u8, 3, 0, 0, 0, 0];
    let err = Control::decode(Control::VERSION_RESPONSE, &payload).unwrap_err();
    assert_eq!(
        err,
        CodecError::Protocol(ProtocolError::Version {
            expected: 2,
            actual: 3
        })
    );
}

#[test]
fn test_short_version_response_accepted() {
    let payload = [0u8, 2, 0, 1, 0, 4];
    let control = Control::decode(Control::VERSION_RESPONSE, &payload).unwrap();
    assert_eq!(
        control,
        Control::VersionResponse {
            version: Version {
                major: 2,
                minor: 1,
                patch: 4
            },
            extensions: String::new(),
        }
    );
}

#[test]
fn test_extension_negotiation_intersects() {
    let mut registry = ExtensionRegistry::new();
    registry
        .register(Arc::new(TlsExtension::new(TICK)))
        .register(Arc::new(CompressionExtension::new(1024)));
    assert_eq!(registry.advertised(), "TLS COMPRESSION");

    let selected = registry.negotiate("compression ZSTD");
    let names: Vec<&str> = selected.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec![COMPRESSION]);
    assert!(registry.negotiate("").is_empty());
}

// ============================================================================
// Streams
// ============================================================================

fn byte_pipe() -> (ByteStream, ByteStream) {
    let (a, b): (MemoryStream<Bytes>, MemoryStream<Bytes>) = memory::pipe("bbdo", 64);
    (Box::new(a), Box::new(b))
}

async fn open_pair(first: BbdoOptions, second: BbdoOptions) -> (BbdoStream, BbdoStream) {
    let catalogue = test_catalogue();
    let (a, b) = byte_pipe();
    let (first, second) = tokio::join!(
        BbdoStream::open(a, catalogue.clone(), first, Role::First),
        BbdoStream::open(b, catalogue, second, Role::Second),
    );
    (first.unwrap(), second.unwrap())
}

async fn next_item(stream: &mut BbdoStream) -> Received<Arc<Event>> {
    for _ in 0..50 {
        match stream.read(TICK).await.unwrap() {
            Received::WouldBlock => continue,
            other => return other,
        }
    }
    Received::WouldBlock
}

fn compressing() -> BbdoOptions {
    let mut options = BbdoOptions::default();
    options
        .extensions
        .register(Arc::new(CompressionExtension::new(1024)));
    options
}

#[tokio::test]
async fn test_stream_negotiates_and_carries_events() {
    let catalogue = test_catalogue();
    let (mut first, mut second) = open_pair(compressing(), compressing()).await;

    let events = vec![
        host_status(&catalogue, 1, 0, "UP"),
        host_status(&catalogue, 2, 2, "CRITICAL"),
    ];
    for event in &events {
        first.write(event.clone()).await.unwrap();
    }
    first.flush().await.unwrap();

    for event in &events {
        assert_eq!(next_item(&mut second).await, Received::Item(event.clone()));
    }
    assert_eq!(second.statistics().events_in, 2);
}

#[tokio::test]
async fn test_unshared_extension_is_not_applied() {
    let catalogue = test_catalogue();
    let (mut first, mut second) = open_pair(compressing(), BbdoOptions::default()).await;

    let event = host_status(&catalogue, 5, 0, "UP");
    first.write(event.clone()).await.unwrap();
    first.flush().await.unwrap();
    assert_eq!(next_item(&mut second).await, Received::Item(event));
}

#[tokio::test]
async fn test_acks_sent_at_limit() {
    let catalogue = test_catalogue();
    let options = BbdoOptions {
        ack_limit: 2,
        ..Default::default()
    };
    let (mut first, mut second) = open_pair(BbdoOptions::default(), options).await;

    for host in 1..=3 {
        first.write(host_status(&catalogue, host, 0, "UP")).await.unwrap();
    }
    first.flush().await.unwrap();
    for _ in 0..3 {
        assert!(matches!(next_item(&mut second).await, Received::Item(_)));
    }

    assert_eq!(
        first.read(Duration::from_millis(50)).await.unwrap(),
        Received::WouldBlock
    );
    assert_eq!(first.take_acknowledged(), 2);
    assert_eq!(first.take_acknowledged(), 0);
}

#[tokio::test]
async fn test_close_sends_stop() {
    let (mut first, mut second) = open_pair(BbdoOptions::default(), BbdoOptions::default()).await;
    first.close().await.unwrap();
    assert_eq!(next_item(&mut second).await, Received::EndOfStream);
    // Stays ended
    assert_eq!(second.read(TICK).await.unwrap(), Received::EndOfStream);
}

#[tokio::test]
async fn test_chunk_arriving_with_version_response_is_kept() {
    let catalogue = test_catalogue();
    let (a, mut b) = byte_pipe();
    let event = host_status(&catalogue, 4, 0, "UP");

    // What the peer writes right after switching to compression.
    let (c, mut d) = byte_pipe();
    let mut compressor = CompressionStream::new(c, 1024);
    compressor.write(encode(&event).unwrap()).await.unwrap();
    compressor.flush().await.unwrap();
    let Received::Item(chunk) = d.read(TICK).await.unwrap() else {
        panic!("no compressed chunk");
    };

    // Both land in one read on the connecting side.
    let mut coalesced = BytesMut::new();
    coalesced.extend_from_slice(&Control::version_response(COMPRESSION).encode());
    coalesced.extend_from_slice(&chunk);
    b.write(coalesced.freeze()).await.unwrap();
    b.flush().await.unwrap();

    let mut first = BbdoStream::open(a, catalogue, compressing(), Role::First)
        .await
        .unwrap();
    assert_eq!(next_item(&mut first).await, Received::Item(event));
}

#[tokio::test]
async fn test_coarse_mode_skips_negotiation() {
    let catalogue = test_catalogue();
    let coarse = BbdoOptions {
        coarse: true,
        ..compressing()
    };
    let (a, b) = byte_pipe();
    // Neither side waits for a version response.
    let mut writer = BbdoStream::open(a, catalogue.clone(), coarse.clone(), Role::First)
        .await
        .unwrap();
    let mut reader = BbdoStream::open(b, catalogue.clone(), coarse, Role::Second)
        .await
        .unwrap();

    let event = host_status(&catalogue, 8, 1, "WARN");
    writer.write(event.clone()).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(next_item(&mut reader).await, Received::Item(event));
}

#[tokio::test]
async fn test_peer_with_other_major_version_rejected() {
    let (a, mut b) = byte_pipe();
    let foreign = encode_frame(Control::VERSION_RESPONSE, 0, 0, &[0, 3, 0, 0, 0, 0, 0, 0, 0, 0]);
    b.write(foreign).await.unwrap();
    b.flush().await.unwrap();

    let result = BbdoStream::open(a, test_catalogue(), BbdoOptions::default(), Role::Second).await;
    assert!(matches!(
        result,
        Err(StreamError::Protocol(ProtocolError::Version { actual: 3, .. }))
    ));
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (a, _b) = byte_pipe();
    let options = BbdoOptions {
        negotiation_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let result = BbdoStream::open(a, test_catalogue(), options, Role::Second).await;
    assert!(matches!(
        result,
        Err(StreamError::Protocol(ProtocolError::Negotiation(_)))
    ));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_chunked_stream_decodes_every_event(
        hosts in prop::collection::vec((any::<i32>(), 0i32..4, "[ -~]{0,40}"), 1..8),
        chunk in 1usize..64,
    ) {
        let catalogue = test_catalogue();
        let events: Vec<_> = hosts
            .iter()
            .map(|(id, state, output)| host_status(&catalogue, *id, *state, output))
            .collect();
        let wire: Vec<u8> = events
            .iter()
            .flat_map(|event| encode(event).unwrap().to_vec())
            .collect();

        let decoder = Decoder::new(catalogue.clone());
        let mut framer = FrameDecoder::default();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            framer.feed(piece);
            while let Some(frame) = framer.next_frame().unwrap() {
                match decoder.decode(&frame).unwrap() {
                    Decoded::Event(event) => decoded.push(event),
                    Decoded::Control(control) => panic!("unexpected {control:?}"),
                }
            }
        }

        let expected: Vec<Event> = events.iter().map(|event| (**event).clone()).collect();
        prop_assert_eq!(decoded, expected);
        prop_assert!(framer.is_idle());
    }
}
