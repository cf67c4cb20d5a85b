//! Control-plane frames of the reserved `bbdo` category.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::encode_frame;
use super::{ProtocolError, Result, Version, BBDO_VERSION};
use crate::catalogue::EventId;
use crate::events::BBDO;

/// Handshake, acknowledgement and shutdown messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Sent by both sides when a connection opens. `extensions` is a
    /// space-separated list of extension names the sender supports.
    VersionResponse {
        version: Version,
        extensions: String,
    },
    /// Number of events the receiver processed since its last ack.
    Ack { count: u32 },
    /// The peer is shutting the connection down cleanly.
    Stop,
}

impl Control {
    pub const VERSION_RESPONSE: EventId = EventId::new(BBDO, 1);
    pub const ACK: EventId = EventId::new(BBDO, 2);
    pub const STOP: EventId = EventId::new(BBDO, 3);

    /// Version response advertising this codec's version.
    pub fn version_response(extensions: impl Into<String>) -> Self {
        Control::VersionResponse {
            version: BBDO_VERSION,
            extensions: extensions.into(),
        }
    }

    pub fn id(&self) -> EventId {
        match self {
            Control::VersionResponse { .. } => Self::VERSION_RESPONSE,
            Control::Ack { .. } => Self::ACK,
            Control::Stop => Self::STOP,
        }
    }

    /// Complete frame carrying this control message.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Control::VersionResponse {
                version,
                extensions,
            } => {
                payload.put_u16(version.major);
                payload.put_u16(version.minor);
                payload.put_u16(version.patch);
                payload.put_u32(extensions.len() as u32);
                payload.extend_from_slice(extensions.as_bytes());
            }
            Control::Ack { count } => payload.put_u32(*count),
            Control::Stop => {}
        }
        encode_frame(self.id(), 0, 0, &payload)
    }

    /// Interpret the payload of a control frame.
    ///
    /// A version response is rejected as soon as its major number is read
    /// if it differs from [`BBDO_VERSION`]; nothing after it is parsed.
    pub fn decode(id: EventId, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        match id {
            Self::VERSION_RESPONSE => {
                let major = read_u16(&mut buf, id)?;
                if major != BBDO_VERSION.major {
                    return Err(ProtocolError::Version {
                        expected: BBDO_VERSION.major,
                        actual: major,
                    }
                    .into());
                }
                // Older peers may stop after the version triple.
                let minor = if buf.is_empty() { 0 } else { read_u16(&mut buf, id)? };
                let patch = if buf.is_empty() { 0 } else { read_u16(&mut buf, id)? };
                let extensions = if buf.is_empty() {
                    String::new()
                } else {
                    let len = read_u32(&mut buf, id)? as usize;
                    if buf.len() < len {
                        return Err(malformed(id, "truncated extension list"));
                    }
                    let raw = &buf[..len];
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| malformed(id, "extension list is not valid UTF-8"))?
                };
                Ok(Control::VersionResponse {
                    version: Version {
                        major,
                        minor,
                        patch,
                    },
                    extensions,
                })
            }
            Self::ACK => Ok(Control::Ack {
                count: read_u32(&mut buf, id)?,
            }),
            Self::STOP => Ok(Control::Stop),
            other => Err(malformed(other, "unknown control element")),
        }
    }
}

fn read_u16(buf: &mut &[u8], id: EventId) -> Result<u16> {
    if buf.len() < 2 {
        return Err(malformed(id, "truncated control field"));
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut &[u8], id: EventId) -> Result<u32> {
    if buf.len() < 4 {
        return Err(malformed(id, "truncated control field"));
    }
    Ok(buf.get_u32())
}

fn malformed(id: EventId, reason: &str) -> super::CodecError {
    ProtocolError::Malformed {
        id,
        reason: reason.to_string(),
    }
    .into()
}
