//! Chunk field snapshot payload.
//!
//! Uncompressed layout: `u32 snapshot_id, u8 payload_ver, u8 field_mask,
//! u16 reserved` followed by one 4096-byte array per selected field in
//! mask-bit order. The whole buffer then goes through a [`Compressor`].

use tilestream_world::{Chunk, ChunkField, DirtyFlags, CHUNK_TILES};

use crate::compress::{CompressError, Compressor};

pub const SNAPSHOT_PAYLOAD_VERSION: u8 = 1;

pub const SNAPSHOT_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldMask(u8);

impl FieldMask {
    pub const HEIGHT: Self = Self(1 << 0);
    pub const RIVER_MASK: Self = Self(1 << 1);
    pub const BIOME: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    /// Mask from raw bits. Unknown bits are rejected.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 != 0 {
            return None;
        }
        Some(Self(bits))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn field_count(self) -> usize {
        (self.0 & Self::ALL.0).count_ones() as usize
    }

    /// Selected fields in wire order.
    pub fn fields(self) -> impl Iterator<Item = ChunkField> {
        ChunkField::ALL
            .into_iter()
            .enumerate()
            .filter(move |(bit, _)| self.0 & (1u8 << *bit) != 0)
            .map(|(_, f)| f)
    }
}

/// Worst-case uncompressed size for `mask`. Scratch buffers for decode
/// are sized from this.
pub const fn max_decompressed_size(mask: FieldMask) -> usize {
    SNAPSHOT_HEADER_SIZE + CHUNK_TILES * mask.field_count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub snapshot_id: u32,
    pub payload_version: u8,
    pub field_mask: FieldMask,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(#[from] CompressError),
    #[error("snapshot payload version {got}, expected {expected}")]
    PayloadVersion { expected: u8, got: u8 },
    #[error("unknown field mask bits {0:#04x}")]
    UnknownFieldBits(u8),
    #[error("snapshot payload too short: need {needed} bytes, have {available}")]
    PayloadTooShort { needed: usize, available: usize },
}

fn write_uncompressed(chunk: &Chunk, snapshot_id: u32, mask: FieldMask) -> Vec<u8> {
    let mut raw = Vec::with_capacity(max_decompressed_size(mask));
    raw.extend_from_slice(&snapshot_id.to_le_bytes());
    raw.push(SNAPSHOT_PAYLOAD_VERSION);
    raw.push(mask.bits());
    raw.extend_from_slice(&[0, 0]);
    for field in mask.fields() {
        raw.extend_from_slice(chunk.field(field));
    }
    raw
}

/// Pack and compress `chunk`'s selected fields into `dst`.
pub fn encode(
    chunk: &Chunk,
    snapshot_id: u32,
    mask: FieldMask,
    compressor: &dyn Compressor,
    dst: &mut [u8],
) -> Result<usize, CodecError> {
    let raw = write_uncompressed(chunk, snapshot_id, mask);
    Ok(compressor.compress(&raw, dst)?)
}

pub fn encode_to_vec(
    chunk: &Chunk,
    snapshot_id: u32,
    mask: FieldMask,
    compressor: &dyn Compressor,
) -> Result<Vec<u8>, CodecError> {
    let raw = write_uncompressed(chunk, snapshot_id, mask);
    let mut out = vec![0u8; compressor.compress_bound(raw.len())];
    let n = compressor.compress(&raw, &mut out)?;
    out.truncate(n);
    Ok(out)
}

/// Decompress into `scratch` and validate the header. Returns the header
/// and the field bytes that follow it.
pub fn decode<'s>(
    src: &[u8],
    compressor: &dyn Compressor,
    scratch: &'s mut [u8],
) -> Result<(SnapshotHeader, &'s [u8]), CodecError> {
    let n = compressor.decompress(src, scratch)?;
    let raw = &scratch[..n];
    if raw.len() < SNAPSHOT_HEADER_SIZE {
        return Err(CodecError::PayloadTooShort {
            needed: SNAPSHOT_HEADER_SIZE,
            available: raw.len(),
        });
    }

    let snapshot_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let payload_version = raw[4];
    if payload_version != SNAPSHOT_PAYLOAD_VERSION {
        return Err(CodecError::PayloadVersion {
            expected: SNAPSHOT_PAYLOAD_VERSION,
            got: payload_version,
        });
    }
    let field_mask = FieldMask::from_bits(raw[5]).ok_or(CodecError::UnknownFieldBits(raw[5]))?;

    let needed = max_decompressed_size(field_mask);
    if raw.len() < needed {
        return Err(CodecError::PayloadTooShort {
            needed,
            available: raw.len(),
        });
    }

    let header = SnapshotHeader {
        snapshot_id,
        payload_version,
        field_mask,
    };
    Ok((header, &raw[SNAPSHOT_HEADER_SIZE..needed]))
}

/// Write decoded fields into `chunk` and move its lineage to the embedded
/// snapshot id. Nothing is written unless `payload` holds every field.
pub fn apply_decoded(header: &SnapshotHeader, payload: &[u8], chunk: &mut Chunk) -> Result<(), CodecError> {
    let needed = CHUNK_TILES * header.field_mask.field_count();
    if payload.len() < needed {
        return Err(CodecError::PayloadTooShort {
            needed,
            available: payload.len(),
        });
    }

    for (field, bytes) in header.field_mask.fields().zip(payload.chunks_exact(CHUNK_TILES)) {
        chunk.field_mut(field).copy_from_slice(bytes);
    }

    chunk.versions.snapshot = header.snapshot_id;
    chunk.versions.height = header.snapshot_id;
    chunk.versions.derived = chunk.versions.derived.wrapping_add(1);
    chunk.versions.render = chunk.versions.render.wrapping_add(1);
    chunk.dirty |= DirtyFlags::DERIVED | DirtyFlags::RENDER;
    chunk.dirty_rect.mark_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{RleCompressor, StoredCompressor};

    fn sample_chunk() -> Chunk {
        let mut chunk = Chunk::default();
        for (i, h) in chunk.height.iter_mut().enumerate() {
            *h = (i % 200) as u8;
        }
        chunk.river_mask[10] = 1;
        chunk.biome.fill(4);
        chunk
    }

    #[test]
    fn test_max_decompressed_size() {
        assert_eq!(max_decompressed_size(FieldMask::HEIGHT), 8 + 4096);
        assert_eq!(max_decompressed_size(FieldMask::ALL), 8 + 4096 * 3);
        assert_eq!(max_decompressed_size(FieldMask::from_bits(0b101).unwrap()), 8 + 4096 * 2);
    }

    #[test]
    fn test_field_order_follows_mask_bits() {
        let mask = FieldMask::from_bits(0b110).unwrap();
        let fields: Vec<_> = mask.fields().collect();
        assert_eq!(fields, vec![ChunkField::RiverMask, ChunkField::Biome]);
        assert!(FieldMask::from_bits(0b1000).is_none());
    }

    #[test]
    fn test_uncompressed_header_layout() {
        let raw = encode_to_vec(&sample_chunk(), 0x0102_0304, FieldMask::HEIGHT, &StoredCompressor).unwrap();
        assert_eq!(&raw[..8], &[4, 3, 2, 1, 1, 1, 0, 0]);
        assert_eq!(raw.len(), 8 + 4096);
        assert_eq!(raw[8 + 5], 5);
    }

    #[test]
    fn test_encode_decode_apply() {
        let src = sample_chunk();
        let packed = encode_to_vec(&src, 42, FieldMask::ALL, &RleCompressor).unwrap();

        let mut scratch = vec![0u8; max_decompressed_size(FieldMask::ALL)];
        let (header, payload) = decode(&packed, &RleCompressor, &mut scratch).unwrap();
        assert_eq!(header.snapshot_id, 42);
        assert_eq!(header.field_mask, FieldMask::ALL);

        let mut dst = Chunk::default();
        dst.versions.derived = 7;
        apply_decoded(&header, payload, &mut dst).unwrap();
        assert!(dst.same_fields(&src));
        assert_eq!(dst.versions.snapshot, 42);
        assert_eq!(dst.versions.height, 42);
        assert_eq!(dst.versions.derived, 8);
        assert!(dst.dirty.contains(DirtyFlags::DERIVED | DirtyFlags::RENDER));
        let rect = dst.dirty_rect.bounds().unwrap();
        assert_eq!((rect.min_x, rect.max_x), (0, 63));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut raw = encode_to_vec(&sample_chunk(), 1, FieldMask::HEIGHT, &StoredCompressor).unwrap();
        raw[4] = 2;
        let mut scratch = vec![0u8; max_decompressed_size(FieldMask::ALL)];
        assert_eq!(
            decode(&raw, &StoredCompressor, &mut scratch).unwrap_err(),
            CodecError::PayloadVersion { expected: 1, got: 2 }
        );
    }

    #[test]
    fn test_decode_rejects_short_fields() {
        let raw = encode_to_vec(&sample_chunk(), 1, FieldMask::ALL, &StoredCompressor).unwrap();
        let mut scratch = vec![0u8; max_decompressed_size(FieldMask::ALL)];
        assert!(matches!(
            decode(&raw[..raw.len() - 1], &StoredCompressor, &mut scratch),
            Err(CodecError::PayloadTooShort { .. })
        ));
        assert!(matches!(
            decode(&raw[..5], &StoredCompressor, &mut scratch),
            Err(CodecError::PayloadTooShort { needed: 8, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_mask_bits() {
        let mut raw = encode_to_vec(&sample_chunk(), 1, FieldMask::HEIGHT, &StoredCompressor).unwrap();
        raw[5] = 0x81;
        let mut scratch = vec![0u8; max_decompressed_size(FieldMask::ALL)];
        assert_eq!(
            decode(&raw, &StoredCompressor, &mut scratch).unwrap_err(),
            CodecError::UnknownFieldBits(0x81)
        );
    }

    #[test]
    fn test_apply_short_payload_leaves_chunk_untouched() {
        let header = SnapshotHeader {
            snapshot_id: 9,
            payload_version: 1,
            field_mask: FieldMask::ALL,
        };
        let mut chunk = Chunk::default();
        let before = chunk.clone();
        assert!(apply_decoded(&header, &[1u8; 4096 * 2], &mut chunk).is_err());
        assert_eq!(chunk, before);
    }
}
