//! BBDO wire protocol.
//!
//! Frame layout (network byte order):
//!
//! ```text
//! 0   u32 checksum        CRC-32 over bytes 4..16 and the payload
//! 4   u32 payload_length
//! 8   u16 category
//! 10  u16 element
//! 12  u16 source_id
//! 14  u16 destination_id
//! 16  payload             fields in schema order
//! ```
//!
//! Category [`crate::events::BBDO`] is reserved for control frames
//! (version handshake, acknowledgements, stop) which the stream layer
//! intercepts before catalogue dispatch.

mod codec;
mod control;
mod extension;
mod stream;

pub use codec::{
    encode, encode_frame, encode_payload, Decoded, Decoder, Frame, FrameDecoder, Header,
    MAX_NESTING_DEPTH,
};
pub use control::Control;
pub use extension::{
    CompressionExtension, Extension, ExtensionRegistry, TlsExtension, COMPRESSION, TLS,
};
pub use stream::{BbdoConnector, BbdoOptions, BbdoStream, Role};

use std::fmt;

use crate::catalogue::{EventId, SchemaError};

/// Fixed size of every frame header.
pub const HEADER_SIZE: usize = 16;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Protocol version spoken by this codec.
pub const BBDO_VERSION: Version = Version {
    major: 2,
    minor: 0,
    patch: 0,
};

/// `major.minor.patch` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Malformed or untrusted input on the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame payload of {length} bytes exceeds maximum of {max}")]
    TooLarge { length: usize, max: usize },

    #[error("checksum mismatch on event {id}: header says {expected:#010x}, computed {actual:#010x}")]
    Corrupt {
        id: EventId,
        expected: u32,
        actual: u32,
    },

    #[error("malformed payload for event {id}: {reason}")]
    Malformed { id: EventId, reason: String },

    #[error("unsupported BBDO major version {actual} (supported: {expected})")]
    Version { expected: u16, actual: u16 },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid compressed chunk: {0}")]
    Compression(String),
}

/// Any failure while turning bytes into events or back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[cfg(test)]
mod tests;
