//! Envelope codec for datagram and stream framing.
//!
//! Wire format: 18-byte little-endian envelope header + payload. The header
//! carries the payload length, so the same codec frames a byte stream or
//! decodes one datagram per call (`UdpFramed`).

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{encode_envelope_into, EnvelopeHeader, ENVELOPE_HEADER_SIZE};
use crate::era::CURRENT_ERA;
use crate::messages::{Message, WireMessage};
use crate::{ProtocolError, WireError};

/// A decoded envelope owning its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub payload: Bytes,
}

impl Envelope {
    /// Frame a typed message with the given sequence and message id.
    pub fn from_message<M: WireMessage>(msg: &M, sequence: u32, message_id: u32) -> Self {
        let payload = Bytes::from(msg.encode_to_vec());
        Self {
            header: EnvelopeHeader::new(M::LANE, M::MESSAGE_TYPE, sequence, message_id, payload.len() as u32),
            payload,
        }
    }

    pub fn message(&self) -> Result<Message, WireError> {
        Message::decode(self.header.message_type, &self.payload)
    }
}

/// Codec for framing [`Envelope`] values.
pub struct EnvelopeCodec {
    max_message_bytes: usize,
}

impl EnvelopeCodec {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(CURRENT_ERA.max_message_bytes)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }

        let header = EnvelopeHeader::parse(src)?;
        let length = header.payload_length as usize;
        if length > self.max_message_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: self.max_message_bytes,
            });
        }

        let total = ENVELOPE_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let payload = frame.split_off(ENVELOPE_HEADER_SIZE).freeze();
        Ok(Some(Envelope { header, payload }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_message_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: item.payload.len(),
                max: self.max_message_bytes,
            });
        }
        let h = item.header;
        encode_envelope_into(h.lane, h.message_type, h.sequence, h.message_id, &item.payload, dst)?;
        Ok(())
    }
}
