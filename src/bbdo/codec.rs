//! Event ⇄ frame conversion and resumable frame decoding.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::control::Control;
use super::{CodecError, ProtocolError, Result, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
use crate::catalogue::{Body, Catalogue, Event, EventId, FieldType, Schema, SchemaError, Value};
use crate::events;

/// Deepest chain of nested event lists a decoded event may carry.
pub const MAX_NESTING_DEPTH: usize = 32;

// ============================================================================
// Frames
// ============================================================================

/// Parsed 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub checksum: u32,
    pub length: u32,
    pub id: EventId,
    pub source_id: u16,
    pub destination_id: u16,
}

impl Header {
    fn parse(raw: &[u8]) -> Self {
        let mut raw = &raw[..HEADER_SIZE];
        Self {
            checksum: raw.get_u32(),
            length: raw.get_u32(),
            id: EventId::new(raw.get_u16(), raw.get_u16()),
            source_id: raw.get_u16(),
            destination_id: raw.get_u16(),
        }
    }

    fn put_covered(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_u16(self.id.category);
        buf.put_u16(self.id.element);
        buf.put_u16(self.source_id);
        buf.put_u16(self.destination_id);
    }

    /// Checksum over header bytes 4..16 followed by the payload.
    fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut covered = BytesMut::with_capacity(HEADER_SIZE - 4);
        self.put_covered(&mut covered);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&covered);
        hasher.update(payload);
        hasher.finalize()
    }
}

/// One checksum-verified frame, payload not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

/// Build a complete frame around an already encoded payload.
pub fn encode_frame(id: EventId, source_id: u16, destination_id: u16, payload: &[u8]) -> Bytes {
    let mut header = Header {
        checksum: 0,
        length: payload.len() as u32,
        id,
        source_id,
        destination_id,
    };
    header.checksum = header.compute_checksum(payload);

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u32(header.checksum);
    header.put_covered(&mut frame);
    frame.extend_from_slice(payload);
    frame.freeze()
}

/// Encode an event into one frame.
///
/// Opaque events are re-emitted verbatim.
pub fn encode(event: &Event) -> Result<Bytes> {
    let payload = encode_payload(event)?;
    Ok(encode_frame(
        event.id,
        event.source_id,
        event.destination_id,
        &payload,
    ))
}

/// Encode the serializable fields of an event, in schema order.
pub fn encode_payload(event: &Event) -> Result<Bytes> {
    match &event.body {
        Body::Opaque(raw) => Ok(raw.clone()),
        Body::Record { schema, values } => {
            let mut buf = BytesMut::new();
            for (index, entry) in schema.serialized_entries() {
                let value = &values[index];
                if value.field_type() != entry.field_type {
                    return Err(SchemaError::TypeMismatch {
                        id: schema.id,
                        field: entry.name.clone(),
                        expected: entry.field_type,
                        actual: value.field_type(),
                    }
                    .into());
                }
                put_value(&mut buf, value)?;
            }
            Ok(buf.freeze())
        }
    }
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::Short(v) => buf.put_i16(*v),
        Value::Int(v) => buf.put_i32(*v),
        Value::UInt(v) => buf.put_u32(*v),
        Value::Long(v) | Value::Time(v) => buf.put_i64(*v),
        Value::ULong(v) => buf.put_u64(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::String(v) => {
            buf.put_u32(v.len() as u32);
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Blob(v) => {
            buf.put_u32(v.len() as u32);
            buf.extend_from_slice(v);
        }
        Value::Events(nested) => {
            buf.put_u32(nested.len() as u32);
            for event in nested {
                let payload = encode_payload(event)?;
                buf.put_u16(event.id.category);
                buf.put_u16(event.id.element);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(&payload);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Resumable frame decoding
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    AwaitingPayload { header: Header, remaining: usize },
}

/// Splits an arbitrarily chunked byte sequence into verified frames.
///
/// Input is appended with [`FrameDecoder::feed`]; each call to
/// [`FrameDecoder::next_frame`] yields at most one frame and keeps partial
/// input buffered until more arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: State,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            state: State::AwaitingHeader,
            max_payload,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Hand over the buffered bytes when sitting on a frame boundary, so
    /// another reader can continue from them. `None` inside a frame.
    pub fn take_unread(&mut self) -> Option<Bytes> {
        match self.state {
            State::AwaitingHeader => Some(self.buf.split().freeze()),
            State::AwaitingPayload { .. } => None,
        }
    }

    /// Whether the decoder sits exactly on a frame boundary.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingHeader) && self.buf.is_empty()
    }

    /// Next complete frame, `None` when more input is needed.
    ///
    /// A checksum mismatch consumes the bad frame, so decoding can resume
    /// at the next header if the caller chooses to keep the transport.
    pub fn next_frame(&mut self) -> std::result::Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = Header::parse(&self.buf);
                    let length = header.length as usize;
                    if length > self.max_payload {
                        return Err(ProtocolError::TooLarge {
                            length,
                            max: self.max_payload,
                        });
                    }
                    self.buf.advance(HEADER_SIZE);
                    self.state = State::AwaitingPayload {
                        header,
                        remaining: length,
                    };
                }
                State::AwaitingPayload { header, remaining } => {
                    if self.buf.len() < remaining {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(remaining).freeze();
                    self.state = State::AwaitingHeader;

                    let actual = header.compute_checksum(&payload);
                    if actual != header.checksum {
                        return Err(ProtocolError::Corrupt {
                            id: header.id,
                            expected: header.checksum,
                            actual,
                        });
                    }
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }
}

// ============================================================================
// Payload decoding
// ============================================================================

/// Interpretation of a verified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Control(Control),
    Event(Event),
}

/// Turns frames into control messages or catalogue events.
#[derive(Debug, Clone)]
pub struct Decoder {
    catalogue: Arc<Catalogue>,
    relay_unknown: bool,
}

impl Decoder {
    pub fn new(catalogue: Arc<Catalogue>) -> Self {
        Self {
            catalogue,
            relay_unknown: false,
        }
    }

    /// Keep events of unknown kinds as opaque payloads instead of failing.
    pub fn relay_unknown(mut self, relay: bool) -> Self {
        self.relay_unknown = relay;
        self
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn decode(&self, frame: &Frame) -> Result<Decoded> {
        if frame.header.id.category == events::BBDO {
            return Ok(Decoded::Control(Control::decode(
                frame.header.id,
                &frame.payload,
            )?));
        }
        let mut event = self.decode_body(frame.header.id, &frame.payload, 0)?;
        event.source_id = frame.header.source_id;
        event.destination_id = frame.header.destination_id;
        Ok(Decoded::Event(event))
    }

    /// Decode a buffer holding exactly one frame.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Decoded> {
        let mut framer = FrameDecoder::default();
        framer.feed(bytes);
        match framer.next_frame()? {
            Some(frame) => self.decode(&frame),
            None => Err(ProtocolError::Malformed {
                id: EventId::new(0, 0),
                reason: format!("incomplete frame ({} bytes)", bytes.len()),
            }
            .into()),
        }
    }

    fn decode_body(&self, id: EventId, payload: &Bytes, depth: usize) -> Result<Event> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::Malformed {
                id,
                reason: format!("events nested deeper than {MAX_NESTING_DEPTH}"),
            }
            .into());
        }
        let schema = match self.catalogue.schema(id) {
            Ok(schema) => schema,
            Err(_) if self.relay_unknown => return Ok(Event::opaque(id, payload.clone())),
            Err(e) => return Err(e.into()),
        };
        let mut reader = Reader::new(id, payload.clone());
        let values = self.decode_values(&schema, &mut reader, depth)?;
        Ok(Event {
            id,
            source_id: 0,
            destination_id: 0,
            body: Body::Record { schema, values },
        })
    }

    /// Fields in declared order. Input ending on a field boundary leaves
    /// the remaining fields at their defaults; trailing bytes are ignored.
    fn decode_values(
        &self,
        schema: &Arc<Schema>,
        reader: &mut Reader,
        depth: usize,
    ) -> Result<Vec<Value>> {
        let mut values = schema.default_values();
        for (index, entry) in schema.serialized_entries() {
            if reader.is_empty() {
                break;
            }
            values[index] = self.read_value(reader, entry.field_type, &entry.name, depth)?;
        }
        Ok(values)
    }

    fn read_value(
        &self,
        reader: &mut Reader,
        field_type: FieldType,
        field: &str,
        depth: usize,
    ) -> Result<Value> {
        let value = match field_type {
            FieldType::Bool => Value::Bool(reader.take(1, field)?.get_u8() != 0),
            FieldType::Short => Value::Short(reader.take(2, field)?.get_i16()),
            FieldType::Int => Value::Int(reader.take(4, field)?.get_i32()),
            FieldType::UInt => Value::UInt(reader.take(4, field)?.get_u32()),
            FieldType::Long => Value::Long(reader.take(8, field)?.get_i64()),
            FieldType::Time => Value::Time(reader.take(8, field)?.get_i64()),
            FieldType::ULong => Value::ULong(reader.take(8, field)?.get_u64()),
            FieldType::Double => Value::Double(reader.take(8, field)?.get_f64()),
            FieldType::String => {
                let raw = reader.take_sized(field)?;
                let text = String::from_utf8(raw.to_vec()).map_err(|_| reader.malformed(
                    format!("field '{field}' is not valid UTF-8"),
                ))?;
                Value::String(text)
            }
            FieldType::Blob => Value::Blob(reader.take_sized(field)?),
            FieldType::Events => {
                let count = reader.take(4, field)?.get_u32();
                let mut nested = Vec::new();
                for _ in 0..count {
                    let mut head = reader.take(8, field)?;
                    let id = EventId::new(head.get_u16(), head.get_u16());
                    let length = head.get_u32() as usize;
                    let payload = reader.take(length, field)?;
                    nested.push(Arc::new(self.decode_body(id, &payload, depth + 1)?));
                }
                Value::Events(nested)
            }
        };
        Ok(value)
    }
}

/// Bounds-checked cursor over a payload.
struct Reader {
    id: EventId,
    buf: Bytes,
}

impl Reader {
    fn new(id: EventId, buf: Bytes) -> Self {
        Self { id, buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<Bytes> {
        if self.buf.len() < len {
            return Err(self.malformed(format!(
                "field '{field}' needs {len} bytes, {} left",
                self.buf.len()
            )));
        }
        Ok(self.buf.split_to(len))
    }

    fn take_sized(&mut self, field: &str) -> Result<Bytes> {
        let len = self.take(4, field)?.get_u32() as usize;
        self.take(len, field)
    }

    fn malformed(&self, reason: String) -> CodecError {
        ProtocolError::Malformed {
            id: self.id,
            reason,
        }
        .into()
    }
}
