//! Message payload codecs.
//!
//! Every payload begins with a one-byte schema version. Decoders check the
//! version first, then the fixed header length, and only then build a value.

use bytes::{Buf, BufMut};
use tilestream_world::{ChunkCoord, CHUNK_SIZE, MAP_H, MAP_W};

use crate::envelope::{Lane, MessageType};
use crate::worldgen::{WorldGenConfig, WORLD_GEN_BLOB_SIZE};
use crate::{ensure_capacity, ensure_len, WireError, PAYLOAD_VERSION};

/// Common shape of every payload codec.
pub trait WireMessage: Sized {
    const MESSAGE_TYPE: MessageType;
    const LANE: Lane;
    const NAME: &'static str;

    fn encoded_len(&self) -> usize;

    /// Write the body after the version byte. `dst` has `encoded_len() - 1`
    /// bytes of room.
    fn write_body(&self, dst: &mut &mut [u8]);

    /// Parse the body after the version byte.
    fn read_body(src: &[u8]) -> Result<Self, WireError>;

    fn encode(&self, dst: &mut [u8]) -> Result<usize, WireError> {
        let len = self.encoded_len();
        ensure_capacity(dst, len)?;
        let mut out = &mut dst[..len];
        out.put_u8(PAYLOAD_VERSION);
        self.write_body(&mut out);
        Ok(len)
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let mut out = &mut buf[..];
        out.put_u8(PAYLOAD_VERSION);
        self.write_body(&mut out);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, 1)?;
        if src[0] != PAYLOAD_VERSION {
            return Err(WireError::PayloadVersion {
                message: Self::NAME,
                expected: PAYLOAD_VERSION,
                got: src[0],
            });
        }
        Self::read_body(&src[1..])
    }
}

fn read_coord(buf: &mut &[u8]) -> ChunkCoord {
    let x = buf.get_i16_le();
    let y = buf.get_i16_le();
    ChunkCoord::new(x, y)
}

fn write_coord(dst: &mut &mut [u8], coord: ChunkCoord) {
    dst.put_i16_le(coord.x);
    dst.put_i16_le(coord.y);
}

// ============================================================================
// ServerHello
// ============================================================================

/// Server greeting carrying the world-gen config blob and its CRC64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub world_gen_version: u32,
    pub world_seed: u64,
    pub map_w: u16,
    pub map_h: u16,
    pub chunk_size: u16,
    pub sea_level: u8,
    pub tick_rate_hz: u32,
    pub config: WorldGenConfig,
    pub config_crc64: u64,
}

const HELLO_FIXED: usize = 4 + 8 + 2 + 2 + 2 + 1 + 1 + 4 + 2;

impl ServerHello {
    pub fn new(config: WorldGenConfig, tick_rate_hz: u32) -> Self {
        Self {
            world_gen_version: config.world_gen_version,
            world_seed: config.world_seed,
            map_w: MAP_W as u16,
            map_h: MAP_H as u16,
            chunk_size: CHUNK_SIZE as u16,
            sea_level: config.sea_level,
            tick_rate_hz,
            config,
            config_crc64: config.checksum(),
        }
    }
}

fn invalid(field: &'static str, reason: String) -> WireError {
    WireError::InvalidField { field, reason }
}

impl WireMessage for ServerHello {
    const MESSAGE_TYPE: MessageType = MessageType::ServerHello;
    const LANE: Lane = Lane::ReliableOrdered;
    const NAME: &'static str = "server hello";

    fn encoded_len(&self) -> usize {
        1 + HELLO_FIXED + WORLD_GEN_BLOB_SIZE + 8
    }

    fn write_body(&self, dst: &mut &mut [u8]) {
        dst.put_u32_le(self.world_gen_version);
        dst.put_u64_le(self.world_seed);
        dst.put_u16_le(self.map_w);
        dst.put_u16_le(self.map_h);
        dst.put_u16_le(self.chunk_size);
        dst.put_u8(self.sea_level);
        dst.put_u8(0);
        dst.put_u32_le(self.tick_rate_hz);
        dst.put_u16_le(WORLD_GEN_BLOB_SIZE as u16);
        dst.put_slice(&self.config.to_blob());
        dst.put_u64_le(self.config_crc64);
    }

    fn read_body(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, HELLO_FIXED)?;
        let mut buf = src;
        let world_gen_version = buf.get_u32_le();
        let world_seed = buf.get_u64_le();
        let map_w = buf.get_u16_le();
        let map_h = buf.get_u16_le();
        let chunk_size = buf.get_u16_le();
        let sea_level = buf.get_u8();
        let _reserved = buf.get_u8();
        let tick_rate_hz = buf.get_u32_le();
        let cfg_len = buf.get_u16_le() as usize;

        if cfg_len != WORLD_GEN_BLOB_SIZE {
            return Err(invalid("cfg_len", format!("{cfg_len}, expected {WORLD_GEN_BLOB_SIZE}")));
        }
        ensure_len(src, HELLO_FIXED + cfg_len + 8)?;
        let config = WorldGenConfig::from_blob(&buf[..cfg_len])?;
        buf.advance(cfg_len);
        let config_crc64 = buf.get_u64_le();

        if config.world_gen_version != world_gen_version {
            return Err(invalid(
                "world_gen_version",
                format!("blob {} != outer {}", config.world_gen_version, world_gen_version),
            ));
        }
        if config.world_seed != world_seed {
            return Err(invalid("world_seed", format!("blob {} != outer {}", config.world_seed, world_seed)));
        }
        if config.sea_level != sea_level {
            return Err(invalid("sea_level", format!("blob {} != outer {}", config.sea_level, sea_level)));
        }
        if map_w as usize != MAP_W || map_h as usize != MAP_H || chunk_size as usize != CHUNK_SIZE {
            return Err(invalid(
                "dimensions",
                format!("{map_w}x{map_h}/{chunk_size}, expected {MAP_W}x{MAP_H}/{CHUNK_SIZE}"),
            ));
        }

        Ok(Self {
            world_gen_version,
            world_seed,
            map_w,
            map_h,
            chunk_size,
            sea_level,
            tick_rate_hz,
            config,
            config_crc64,
        })
    }
}

// ============================================================================
// ChunkSnapshotFrag
// ============================================================================

/// Snapshot codec id for the compressed field payload.
pub const SNAPSHOT_CODEC_COMPRESSED: u16 = 1;

/// One fragment of a compressed chunk snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSnapshotFrag {
    pub coord: ChunkCoord,
    pub snapshot_id: u32,
    pub total_len: u32,
    pub frag_index: u16,
    pub frag_count: u16,
    pub codec: u16,
    pub payload: Vec<u8>,
}

const FRAG_FIXED: usize = 2 + 2 + 4 + 4 + 2 + 2 + 2 + 2;

impl ChunkSnapshotFrag {
    pub fn frag_len(&self) -> usize {
        self.payload.len()
    }
}

impl WireMessage for ChunkSnapshotFrag {
    const MESSAGE_TYPE: MessageType = MessageType::ChunkSnapshotFrag;
    const LANE: Lane = Lane::UnreliableSequenced;
    const NAME: &'static str = "chunk snapshot fragment";

    fn encoded_len(&self) -> usize {
        1 + FRAG_FIXED + self.payload.len()
    }

    fn write_body(&self, dst: &mut &mut [u8]) {
        write_coord(dst, self.coord);
        dst.put_u32_le(self.snapshot_id);
        dst.put_u32_le(self.total_len);
        dst.put_u16_le(self.frag_index);
        dst.put_u16_le(self.frag_count);
        // Fragments are planned well below u16::MAX; see `fragment`.
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_u16_le(self.codec);
        dst.put_slice(&self.payload);
    }

    fn read_body(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, FRAG_FIXED)?;
        let mut buf = src;
        let coord = read_coord(&mut buf);
        let snapshot_id = buf.get_u32_le();
        let total_len = buf.get_u32_le();
        let frag_index = buf.get_u16_le();
        let frag_count = buf.get_u16_le();
        let frag_len = buf.get_u16_le() as usize;
        let codec = buf.get_u16_le();

        if frag_index >= frag_count {
            return Err(invalid("frag_index", format!("{frag_index} >= frag_count {frag_count}")));
        }
        ensure_len(src, FRAG_FIXED + frag_len)?;

        Ok(Self {
            coord,
            snapshot_id,
            total_len,
            frag_index,
            frag_count,
            codec,
            payload: buf[..frag_len].to_vec(),
        })
    }
}

// ============================================================================
// ChunkPatchRect
// ============================================================================

/// Rectangular edit of one chunk moving its lineage from `base` to `new`.
///
/// The payload is the remainder of the message; its length is checked
/// against `rw * rh` by the applier, not the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPatchRect {
    pub coord: ChunkCoord,
    pub base_snapshot_id: u32,
    pub new_snapshot_id: u32,
    pub rx: u8,
    pub ry: u8,
    pub rw: u8,
    pub rh: u8,
    pub field_mask: u8,
    pub codec: u8,
    pub payload: Vec<u8>,
}

const PATCH_FIXED: usize = 2 + 2 + 4 + 4 + 6;

impl WireMessage for ChunkPatchRect {
    const MESSAGE_TYPE: MessageType = MessageType::ChunkPatchRect;
    const LANE: Lane = Lane::ReliableOrdered;
    const NAME: &'static str = "chunk patch rect";

    fn encoded_len(&self) -> usize {
        1 + PATCH_FIXED + self.payload.len()
    }

    fn write_body(&self, dst: &mut &mut [u8]) {
        write_coord(dst, self.coord);
        dst.put_u32_le(self.base_snapshot_id);
        dst.put_u32_le(self.new_snapshot_id);
        dst.put_slice(&[self.rx, self.ry, self.rw, self.rh, self.field_mask, self.codec]);
        dst.put_slice(&self.payload);
    }

    fn read_body(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, PATCH_FIXED)?;
        let mut buf = src;
        let coord = read_coord(&mut buf);
        let base_snapshot_id = buf.get_u32_le();
        let new_snapshot_id = buf.get_u32_le();
        Ok(Self {
            coord,
            base_snapshot_id,
            new_snapshot_id,
            rx: buf.get_u8(),
            ry: buf.get_u8(),
            rw: buf.get_u8(),
            rh: buf.get_u8(),
            field_mask: buf.get_u8(),
            codec: buf.get_u8(),
            payload: buf.to_vec(),
        })
    }
}

// ============================================================================
// ChunkResyncRequest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncReason {
    PatchBaseMismatch,
    SnapshotDecodeFailed,
    TransferTimedOut,
}

impl ResyncReason {
    pub const fn as_u8(self) -> u8 {
        match self {
            ResyncReason::PatchBaseMismatch => 1,
            ResyncReason::SnapshotDecodeFailed => 2,
            ResyncReason::TransferTimedOut => 3,
        }
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ResyncReason::PatchBaseMismatch),
            2 => Some(ResyncReason::SnapshotDecodeFailed),
            3 => Some(ResyncReason::TransferTimedOut),
            _ => None,
        }
    }
}

/// Client request for a full snapshot of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkResyncRequest {
    pub coord: ChunkCoord,
    pub expected_base_snapshot_id: u32,
    pub client_snapshot_id: u32,
    pub reason: ResyncReason,
}

const RESYNC_FIXED: usize = 2 + 2 + 4 + 4 + 1;

impl WireMessage for ChunkResyncRequest {
    const MESSAGE_TYPE: MessageType = MessageType::ChunkResyncRequest;
    const LANE: Lane = Lane::ReliableOrdered;
    const NAME: &'static str = "chunk resync request";

    fn encoded_len(&self) -> usize {
        1 + RESYNC_FIXED
    }

    fn write_body(&self, dst: &mut &mut [u8]) {
        write_coord(dst, self.coord);
        dst.put_u32_le(self.expected_base_snapshot_id);
        dst.put_u32_le(self.client_snapshot_id);
        dst.put_u8(self.reason.as_u8());
    }

    fn read_body(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, RESYNC_FIXED)?;
        let mut buf = src;
        let coord = read_coord(&mut buf);
        let expected_base_snapshot_id = buf.get_u32_le();
        let client_snapshot_id = buf.get_u32_le();
        let code = buf.get_u8();
        let reason = ResyncReason::from_u8(code).ok_or_else(|| invalid("reason", format!("unknown code {code}")))?;
        Ok(Self {
            coord,
            expected_base_snapshot_id,
            client_snapshot_id,
            reason,
        })
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Any message this protocol version understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ServerHello(ServerHello),
    ChunkSnapshotFrag(ChunkSnapshotFrag),
    ChunkPatchRect(ChunkPatchRect),
    ChunkResyncRequest(ChunkResyncRequest),
}

impl Message {
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, WireError> {
        Ok(match message_type {
            MessageType::ServerHello => Message::ServerHello(ServerHello::decode(payload)?),
            MessageType::ChunkSnapshotFrag => Message::ChunkSnapshotFrag(ChunkSnapshotFrag::decode(payload)?),
            MessageType::ChunkPatchRect => Message::ChunkPatchRect(ChunkPatchRect::decode(payload)?),
            MessageType::ChunkResyncRequest => Message::ChunkResyncRequest(ChunkResyncRequest::decode(payload)?),
            MessageType::Unknown(v) => return Err(WireError::UnknownMessageType(v)),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ServerHello(_) => ServerHello::MESSAGE_TYPE,
            Message::ChunkSnapshotFrag(_) => ChunkSnapshotFrag::MESSAGE_TYPE,
            Message::ChunkPatchRect(_) => ChunkPatchRect::MESSAGE_TYPE,
            Message::ChunkResyncRequest(_) => ChunkResyncRequest::MESSAGE_TYPE,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            Message::ServerHello(_) => ServerHello::LANE,
            Message::ChunkSnapshotFrag(_) => ChunkSnapshotFrag::LANE,
            Message::ChunkPatchRect(_) => ChunkPatchRect::LANE,
            Message::ChunkResyncRequest(_) => ChunkResyncRequest::LANE,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Message::ServerHello(m) => m.encode_to_vec(),
            Message::ChunkSnapshotFrag(m) => m.encode_to_vec(),
            Message::ChunkPatchRect(m) => m.encode_to_vec(),
            Message::ChunkResyncRequest(m) => m.encode_to_vec(),
        }
    }
}
