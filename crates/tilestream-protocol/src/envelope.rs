//! Fixed 18-byte envelope framing every datagram.
//!
//! Layout (little-endian):
//! `u16 protocol_version, u8 lane, u8 reserved, u16 message_type,
//!  u32 sequence, u32 message_id, u32 payload_length` + payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::{ensure_capacity, ensure_len, WireError};

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

pub const ENVELOPE_HEADER_SIZE: usize = 18;

/// Delivery lane. Informational at this layer; the transport provides
/// the actual delivery semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    ReliableOrdered,
    UnreliableSequenced,
    Other(u8),
}

impl Lane {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Lane::ReliableOrdered,
            1 => Lane::UnreliableSequenced,
            other => Lane::Other(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Lane::ReliableOrdered => 0,
            Lane::UnreliableSequenced => 1,
            Lane::Other(v) => v,
        }
    }
}

/// Message type tag. Unknown tags survive envelope decoding and are
/// rejected by message dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ServerHello,
    ChunkSnapshotFrag,
    ChunkPatchRect,
    ChunkResyncRequest,
    Unknown(u16),
}

impl MessageType {
    pub const fn from_u16(v: u16) -> Self {
        match v {
            2 => MessageType::ServerHello,
            10 => MessageType::ChunkSnapshotFrag,
            11 => MessageType::ChunkPatchRect,
            12 => MessageType::ChunkResyncRequest,
            other => MessageType::Unknown(other),
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            MessageType::ServerHello => 2,
            MessageType::ChunkSnapshotFrag => 10,
            MessageType::ChunkPatchRect => 11,
            MessageType::ChunkResyncRequest => 12,
            MessageType::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub protocol_version: u16,
    pub lane: Lane,
    pub reserved: u8,
    pub message_type: MessageType,
    pub sequence: u32,
    pub message_id: u32,
    pub payload_length: u32,
}

impl EnvelopeHeader {
    pub fn new(lane: Lane, message_type: MessageType, sequence: u32, message_id: u32, payload_length: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            lane,
            reserved: 0,
            message_type,
            sequence,
            message_id,
            payload_length,
        }
    }

    fn write(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.protocol_version);
        dst.put_u8(self.lane.as_u8());
        dst.put_u8(self.reserved);
        dst.put_u16_le(self.message_type.as_u16());
        dst.put_u32_le(self.sequence);
        dst.put_u32_le(self.message_id);
        dst.put_u32_le(self.payload_length);
    }

    /// Parse a header without looking at the payload. `src` must hold at
    /// least [`ENVELOPE_HEADER_SIZE`] bytes.
    pub fn parse(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, ENVELOPE_HEADER_SIZE)?;
        let mut buf = src;
        let protocol_version = buf.get_u16_le();
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            });
        }
        Ok(Self {
            protocol_version,
            lane: Lane::from_u8(buf.get_u8()),
            reserved: buf.get_u8(),
            message_type: MessageType::from_u16(buf.get_u16_le()),
            sequence: buf.get_u32_le(),
            message_id: buf.get_u32_le(),
            payload_length: buf.get_u32_le(),
        })
    }
}

fn payload_len_u32(payload: &[u8]) -> Result<u32, WireError> {
    u32::try_from(payload.len()).map_err(|_| WireError::InvalidField {
        field: "payload_length",
        reason: format!("{} bytes exceeds u32", payload.len()),
    })
}

/// Write header and payload into `dst`. Returns bytes written.
pub fn encode_envelope(
    lane: Lane,
    message_type: MessageType,
    sequence: u32,
    message_id: u32,
    payload: &[u8],
    dst: &mut [u8],
) -> Result<usize, WireError> {
    let len = payload_len_u32(payload)?;
    let total = ENVELOPE_HEADER_SIZE + payload.len();
    ensure_capacity(dst, total)?;

    let mut out = &mut dst[..total];
    EnvelopeHeader::new(lane, message_type, sequence, message_id, len).write(&mut out);
    out.put_slice(payload);
    Ok(total)
}

/// Growable variant of [`encode_envelope`].
pub fn encode_envelope_into(
    lane: Lane,
    message_type: MessageType,
    sequence: u32,
    message_id: u32,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<usize, WireError> {
    let len = payload_len_u32(payload)?;
    dst.reserve(ENVELOPE_HEADER_SIZE + payload.len());
    EnvelopeHeader::new(lane, message_type, sequence, message_id, len).write(dst);
    dst.put_slice(payload);
    Ok(ENVELOPE_HEADER_SIZE + payload.len())
}

/// Split `src` into header and payload view. Bytes after the declared
/// payload are ignored.
pub fn decode_envelope(src: &[u8]) -> Result<(EnvelopeHeader, &[u8]), WireError> {
    let header = EnvelopeHeader::parse(src)?;
    let body = &src[ENVELOPE_HEADER_SIZE..];
    let len = header.payload_length as usize;
    if len > body.len() {
        return Err(WireError::Truncated {
            needed: ENVELOPE_HEADER_SIZE + len,
            available: src.len(),
        });
    }
    Ok((header, &body[..len]))
}
