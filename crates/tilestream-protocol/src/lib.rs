//! Tilestream Protocol -- wire envelope, message codecs, handshake checks.
//!
//! Every datagram is an 18-byte little-endian envelope followed by a
//! message payload. Every payload starts with a one-byte schema version.

pub mod codec;
pub mod crc64;
pub mod envelope;
pub mod era;
pub mod fragment;
pub mod handshake;
pub mod messages;
pub mod worldgen;

pub use codec::{Envelope, EnvelopeCodec};
pub use crc64::crc64;
pub use envelope::{
    decode_envelope, encode_envelope, encode_envelope_into, EnvelopeHeader, Lane, MessageType,
    ENVELOPE_HEADER_SIZE, PROTOCOL_VERSION,
};
pub use era::{ProtocolEra, CURRENT_ERA, ERA_0};
pub use fragment::{frag_count, frag_payload_capacity, FragmentPlan, FRAG_HEADER_SIZE, MAX_DATAGRAM_PAYLOAD};
pub use handshake::{validate_server_hello, HandshakeError};
pub use messages::*;
pub use worldgen::{WorldGenConfig, WorldGenConfigError, WORLD_GEN_BLOB_SIZE};

/// Schema version carried in the first byte of every message payload.
pub const PAYLOAD_VERSION: u8 = 1;

/// Decode/encode failures. Decoders never hand back partial values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },
    #[error("{message} payload version mismatch: expected {expected}, got {got}")]
    PayloadVersion {
        message: &'static str,
        expected: u8,
        got: u8,
    },
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors from the framed envelope codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn ensure_len(src: &[u8], needed: usize) -> Result<(), WireError> {
    if src.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: src.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_capacity(dst: &[u8], needed: usize) -> Result<(), WireError> {
    if dst.len() < needed {
        return Err(WireError::BufferTooSmall {
            needed,
            available: dst.len(),
        });
    }
    Ok(())
}
