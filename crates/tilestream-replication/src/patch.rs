//! Lineage-checked rect patches.
//!
//! A patch moves one chunk from `base` to `new` snapshot id by rewriting a
//! rectangle of its height field. Clients apply it only when their local
//! snapshot id equals `base`; otherwise they may ask for a full resync,
//! subject to a per-chunk cooldown and a global sliding window.

use std::collections::VecDeque;

use tilestream_protocol::{ChunkPatchRect, ChunkResyncRequest, ResyncReason, WireError, WireMessage};
use tilestream_world::{Chunk, ChunkCoord, ChunkIndex, ChunkStore, DirtyFlags, TileRect, CHUNK_COUNT, CHUNK_SIZE};
use tracing::{debug, warn};

use crate::counters::ReplicationCounters;
use crate::snapshot_codec::FieldMask;
use crate::{ReplicationConfig, ReplicationErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchCodec {
    /// Payload bytes replace the rect verbatim.
    AbsU8,
    /// Payload bytes are signed deltas, clamped to `0..=255`.
    DeltaI8,
    /// Reserved; not accepted.
    RleDelta,
}

impl PatchCodec {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PatchCodec::AbsU8),
            1 => Some(PatchCodec::DeltaI8),
            2 => Some(PatchCodec::RleDelta),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            PatchCodec::AbsU8 => 0,
            PatchCodec::DeltaI8 => 1,
            PatchCodec::RleDelta => 2,
        }
    }
}

/// Rectangle in chunk-local tiles: `[rx, rx + rw) x [ry, ry + rh)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRect {
    pub rx: u8,
    pub ry: u8,
    pub rw: u8,
    pub rh: u8,
}

impl PatchRect {
    pub const fn new(rx: u8, ry: u8, rw: u8, rh: u8) -> Self {
        Self { rx, ry, rw, rh }
    }

    pub fn fits_chunk(&self) -> bool {
        self.rx as usize + self.rw as usize <= CHUNK_SIZE && self.ry as usize + self.rh as usize <= CHUNK_SIZE
    }

    pub fn area(&self) -> usize {
        self.rw as usize * self.rh as usize
    }

    /// Tile indices covered, row-major.
    pub fn tiles(&self) -> impl Iterator<Item = usize> {
        let (rx, ry, rw, rh) = (self.rx as usize, self.ry as usize, self.rw as usize, self.rh as usize);
        (ry..ry + rh).flat_map(move |y| (rx..rx + rw).map(move |x| Chunk::tile_index(x, y)))
    }

    fn of(patch: &ChunkPatchRect) -> Self {
        Self::new(patch.rx, patch.ry, patch.rw, patch.rh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(#[from] WireError),
    #[error("patch chunk {0} outside the grid")]
    ChunkOutOfRange(ChunkCoord),
    #[error("patch lineage does not advance: base {base}, new {new}")]
    NonMonotonicLineage { base: u32, new: u32 },
    #[error("lineage mismatch on chunk {coord}: patch base {expected_base}, local {local}")]
    LineageMismatch {
        coord: ChunkCoord,
        expected_base: u32,
        local: u32,
        /// Set when the throttle let a resync request through.
        resync: Option<ChunkResyncRequest>,
    },
    #[error("patch rect {rect:?} exceeds chunk bounds")]
    RectOutOfBounds { rect: PatchRect },
    #[error("patch field mask {0:#04x} lacks the height field")]
    MissingHeightField(u8),
    #[error("patch payload is {got} bytes, rect needs {expected}")]
    PayloadLength { expected: usize, got: usize },
    #[error("unsupported patch codec {0}")]
    UnsupportedCodec(u8),
    #[error("tile delta {delta} at index {tile} does not fit i8")]
    DeltaOutOfRange { tile: usize, delta: i16 },
}

impl PatchError {
    pub fn code(&self) -> ReplicationErrorCode {
        match self {
            PatchError::Malformed(_)
            | PatchError::ChunkOutOfRange(_)
            | PatchError::RectOutOfBounds { .. }
            | PatchError::PayloadLength { .. }
            | PatchError::DeltaOutOfRange { .. } => ReplicationErrorCode::MalformedPayload,
            PatchError::NonMonotonicLineage { .. } | PatchError::MissingHeightField(_) => {
                ReplicationErrorCode::InvalidTransferMetadata
            }
            PatchError::LineageMismatch { .. } => ReplicationErrorCode::LineageMismatch,
            PatchError::UnsupportedCodec(_) => ReplicationErrorCode::UnsupportedCodec,
        }
    }
}

/// A successfully applied patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchApplied {
    pub chunk: ChunkIndex,
    pub snapshot_id: u32,
    pub rect: TileRect,
}

/// Per-chunk cooldown plus a global FIFO window of issue ticks.
#[derive(Debug, Clone)]
pub struct ResyncThrottle {
    cooldown_ticks: u64,
    window_ticks: u64,
    max_per_window: usize,
    last_request: Vec<Option<u64>>,
    window: VecDeque<u64>,
}

impl ResyncThrottle {
    /// Zero values select the era defaults.
    pub fn new(cooldown_ticks: u64, window_ticks: u64, max_per_window: usize) -> Self {
        let defaults = ReplicationConfig::default();
        Self {
            cooldown_ticks: if cooldown_ticks == 0 { defaults.resync_cooldown_ticks } else { cooldown_ticks },
            window_ticks: if window_ticks == 0 { defaults.resync_window_ticks } else { window_ticks },
            max_per_window: if max_per_window == 0 { defaults.resync_max_per_window } else { max_per_window },
            last_request: vec![None; CHUNK_COUNT],
            window: VecDeque::new(),
        }
    }

    /// Whether `chunk` may issue a resync at `now`. Records the request
    /// when allowed.
    pub fn allow(&mut self, chunk: ChunkIndex, now: u64) -> bool {
        while let Some(&first) = self.window.front() {
            if now.saturating_sub(first) >= self.window_ticks {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() >= self.max_per_window {
            return false;
        }

        let slot = &mut self.last_request[chunk.as_usize()];
        if let Some(last) = *slot {
            if now.saturating_sub(last) < self.cooldown_ticks {
                return false;
            }
        }

        *slot = Some(now);
        self.window.push_back(now);
        true
    }
}

/// Client-side patch applier for one connection.
#[derive(Debug, Clone)]
pub struct PatchApplier {
    throttle: ResyncThrottle,
    last_error: ReplicationErrorCode,
}

impl PatchApplier {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            throttle: ResyncThrottle::new(
                config.resync_cooldown_ticks,
                config.resync_window_ticks,
                config.resync_max_per_window,
            ),
            last_error: ReplicationErrorCode::None,
        }
    }

    pub fn last_error_code(&self) -> ReplicationErrorCode {
        self.last_error
    }

    /// Pass a resync request through the connection's throttle. Every
    /// request the client sends goes through here so the window cap holds
    /// across lineage mismatches and retries alike.
    pub fn throttle_resync(
        &mut self,
        counters: &mut ReplicationCounters,
        request: ChunkResyncRequest,
        now: u64,
    ) -> Option<ChunkResyncRequest> {
        let index = request.coord.index()?;
        if self.throttle.allow(index, now) {
            counters.resync_issued += 1;
            Some(request)
        } else {
            counters.resync_suppressed += 1;
            None
        }
    }

    /// Apply one encoded patch payload. Either the whole rect is written
    /// and lineage advances, or nothing changes.
    pub fn apply<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        counters: &mut ReplicationCounters,
        payload: &[u8],
        now: u64,
    ) -> Result<PatchApplied, PatchError> {
        let result = self.apply_inner(store, counters, payload, now);
        self.last_error = match &result {
            Ok(_) => ReplicationErrorCode::None,
            Err(e) => e.code(),
        };
        result
    }

    fn apply_inner<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        counters: &mut ReplicationCounters,
        payload: &[u8],
        now: u64,
    ) -> Result<PatchApplied, PatchError> {
        let patch = ChunkPatchRect::decode(payload)?;
        let index = patch.coord.index().ok_or(PatchError::ChunkOutOfRange(patch.coord))?;

        if patch.new_snapshot_id <= patch.base_snapshot_id {
            return Err(PatchError::NonMonotonicLineage {
                base: patch.base_snapshot_id,
                new: patch.new_snapshot_id,
            });
        }

        let local = store
            .chunk(index)
            .ok_or(PatchError::ChunkOutOfRange(patch.coord))?
            .versions
            .snapshot;
        if local != patch.base_snapshot_id {
            counters.patch_mismatches += 1;
            let request = ChunkResyncRequest {
                coord: patch.coord,
                expected_base_snapshot_id: patch.base_snapshot_id,
                client_snapshot_id: local,
                reason: ResyncReason::PatchBaseMismatch,
            };
            let resync = self.throttle_resync(counters, request, now);
            warn!(
                chunk = %patch.coord,
                expected_base = patch.base_snapshot_id,
                local,
                resync = resync.is_some(),
                "patch lineage mismatch"
            );
            return Err(PatchError::LineageMismatch {
                coord: patch.coord,
                expected_base: patch.base_snapshot_id,
                local,
                resync,
            });
        }

        let rect = PatchRect::of(&patch);
        if !rect.fits_chunk() {
            return Err(PatchError::RectOutOfBounds { rect });
        }
        if patch.field_mask & FieldMask::HEIGHT.bits() == 0 {
            return Err(PatchError::MissingHeightField(patch.field_mask));
        }
        let codec = match PatchCodec::from_u8(patch.codec) {
            Some(c @ (PatchCodec::AbsU8 | PatchCodec::DeltaI8)) => c,
            _ => return Err(PatchError::UnsupportedCodec(patch.codec)),
        };
        if patch.payload.len() != rect.area() {
            return Err(PatchError::PayloadLength {
                expected: rect.area(),
                got: patch.payload.len(),
            });
        }

        let chunk = store.chunk_mut(index).ok_or(PatchError::ChunkOutOfRange(patch.coord))?;
        match codec {
            PatchCodec::AbsU8 => {
                for (tile, &v) in rect.tiles().zip(&patch.payload) {
                    chunk.height[tile] = v;
                }
            }
            _ => {
                for (tile, &d) in rect.tiles().zip(&patch.payload) {
                    chunk.height[tile] = apply_delta(chunk.height[tile], d);
                }
            }
        }

        chunk.versions.snapshot = patch.new_snapshot_id;
        chunk.versions.height = patch.new_snapshot_id;
        chunk.dirty |= DirtyFlags::DERIVED | DirtyFlags::SNAPSHOT | DirtyFlags::RENDER;
        chunk.dirty_rect.mark_rect(rect.rx, rect.ry, rect.rw, rect.rh);
        counters.patch_applies += 1;

        debug!(
            chunk = %patch.coord,
            snapshot = patch.new_snapshot_id,
            tiles = rect.area(),
            "patch applied"
        );

        Ok(PatchApplied {
            chunk: index,
            snapshot_id: patch.new_snapshot_id,
            rect: TileRect {
                min_x: rect.rx,
                min_y: rect.ry,
                max_x: rect.rx + rect.rw.saturating_sub(1),
                max_y: rect.ry + rect.rh.saturating_sub(1),
            },
        })
    }
}

fn apply_delta(base: u8, delta: u8) -> u8 {
    (base as i16 + delta as i8 as i16).clamp(0, 255) as u8
}

/// Signed per-tile deltas `after - before`, or `None` if any tile moved by
/// more than an i8 can carry.
pub fn encode_delta_i8(before: &[u8], after: &[u8]) -> Option<Vec<u8>> {
    before
        .iter()
        .zip(after)
        .map(|(&b, &a)| i8::try_from(a as i16 - b as i16).ok().map(|d| d as u8))
        .collect()
}

/// Add clamped deltas into `values` in place.
pub fn decode_delta_i8(values: &mut [u8], deltas: &[u8]) {
    for (v, &d) in values.iter_mut().zip(deltas) {
        *v = apply_delta(*v, d);
    }
}

fn rect_heights(chunk: &Chunk, rect: PatchRect) -> Vec<u8> {
    rect.tiles().map(|t| chunk.height[t]).collect()
}

/// Server side: an `AbsU8` patch carrying `chunk`'s current heights in `rect`.
pub fn build_abs_patch(
    chunk: &Chunk,
    coord: ChunkCoord,
    base_snapshot_id: u32,
    new_snapshot_id: u32,
    rect: PatchRect,
) -> Result<ChunkPatchRect, PatchError> {
    if !rect.fits_chunk() {
        return Err(PatchError::RectOutOfBounds { rect });
    }
    Ok(ChunkPatchRect {
        coord,
        base_snapshot_id,
        new_snapshot_id,
        rx: rect.rx,
        ry: rect.ry,
        rw: rect.rw,
        rh: rect.rh,
        field_mask: FieldMask::HEIGHT.bits(),
        codec: PatchCodec::AbsU8.as_u8(),
        payload: rect_heights(chunk, rect),
    })
}

/// Server side: a `DeltaI8` patch moving `before` to `after` within `rect`.
pub fn build_delta_patch(
    before: &Chunk,
    after: &Chunk,
    coord: ChunkCoord,
    base_snapshot_id: u32,
    new_snapshot_id: u32,
    rect: PatchRect,
) -> Result<ChunkPatchRect, PatchError> {
    if !rect.fits_chunk() {
        return Err(PatchError::RectOutOfBounds { rect });
    }
    let old = rect_heights(before, rect);
    let new = rect_heights(after, rect);
    let payload = match encode_delta_i8(&old, &new) {
        Some(p) => p,
        None => {
            let (tile, delta) = rect
                .tiles()
                .map(|t| (t, after.height[t] as i16 - before.height[t] as i16))
                .find(|&(_, d)| i8::try_from(d).is_err())
                .unwrap_or((0, 0));
            return Err(PatchError::DeltaOutOfRange { tile, delta });
        }
    };
    Ok(ChunkPatchRect {
        coord,
        base_snapshot_id,
        new_snapshot_id,
        rx: rect.rx,
        ry: rect.ry,
        rw: rect.rw,
        rh: rect.rh,
        field_mask: FieldMask::HEIGHT.bits(),
        codec: PatchCodec::DeltaI8.as_u8(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilestream_world::{MemoryChunkStore, DEFAULT_SEA_LEVEL};

    const COORD: ChunkCoord = ChunkCoord::new(2, 3);

    fn store_at(snapshot: u32) -> MemoryChunkStore {
        let mut store = MemoryChunkStore::new(DEFAULT_SEA_LEVEL);
        store.chunk_mut(COORD.index().unwrap()).unwrap().versions.snapshot = snapshot;
        store
    }

    fn abs_patch(base: u32, new: u32, rect: PatchRect, payload: Vec<u8>) -> Vec<u8> {
        ChunkPatchRect {
            coord: COORD,
            base_snapshot_id: base,
            new_snapshot_id: new,
            rx: rect.rx,
            ry: rect.ry,
            rw: rect.rw,
            rh: rect.rh,
            field_mask: 1,
            codec: 0,
            payload,
        }
        .encode_to_vec()
    }

    fn applier(cooldown: u64, window: u64, max: usize) -> PatchApplier {
        PatchApplier::new(&ReplicationConfig {
            resync_cooldown_ticks: cooldown,
            resync_window_ticks: window,
            resync_max_per_window: max,
            ..Default::default()
        })
    }

    fn chunk(store: &MemoryChunkStore) -> &Chunk {
        store.chunk(COORD.index().unwrap()).unwrap()
    }

    #[test]
    fn test_apply_then_mismatch_then_suppressed() {
        let mut store = store_at(5);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 1);

        let ok = applier
            .apply(&mut store, &mut counters, &abs_patch(5, 6, PatchRect::new(0, 0, 1, 1), vec![123]), 1)
            .unwrap();
        assert_eq!(ok.snapshot_id, 6);
        assert_eq!(chunk(&store).height[0], 123);
        assert_eq!(chunk(&store).versions.snapshot, 6);
        assert_eq!(chunk(&store).versions.height, 6);

        let bad = abs_patch(5, 7, PatchRect::new(0, 0, 1, 1), vec![9]);
        match applier.apply(&mut store, &mut counters, &bad, 2) {
            Err(PatchError::LineageMismatch {
                expected_base,
                local,
                resync: Some(req),
                ..
            }) => {
                assert_eq!(expected_base, 5);
                assert_eq!(local, 6);
                assert_eq!(req.expected_base_snapshot_id, 5);
                assert_eq!(req.client_snapshot_id, 6);
                assert_eq!(req.reason, ResyncReason::PatchBaseMismatch);
            }
            other => panic!("expected issued resync, got {other:?}"),
        }
        assert_eq!(applier.last_error_code(), ReplicationErrorCode::LineageMismatch);

        match applier.apply(&mut store, &mut counters, &bad, 3) {
            Err(PatchError::LineageMismatch { resync: None, .. }) => {}
            other => panic!("expected suppressed resync, got {other:?}"),
        }
        assert_eq!(chunk(&store).height[0], 123, "mismatched patch must not write");

        assert_eq!(counters.patch_applies, 1);
        assert_eq!(counters.patch_mismatches, 2);
        assert_eq!(counters.resync_issued, 1);
        assert_eq!(counters.resync_suppressed, 1);
    }

    #[test]
    fn test_cooldown_expiry_issues_again() {
        let mut store = store_at(6);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);
        let bad = abs_patch(5, 7, PatchRect::new(0, 0, 1, 1), vec![9]);

        let issued = |r: Result<PatchApplied, PatchError>| matches!(r, Err(PatchError::LineageMismatch { resync: Some(_), .. }));
        assert!(issued(applier.apply(&mut store, &mut counters, &bad, 0)));
        assert!(!issued(applier.apply(&mut store, &mut counters, &bad, 1)));
        assert!(issued(applier.apply(&mut store, &mut counters, &bad, 10)));
        assert_eq!(counters.resync_issued, 2);
        assert_eq!(counters.resync_suppressed, 1);
    }

    #[test]
    fn test_global_window_caps_bursts() {
        let mut throttle = ResyncThrottle::new(1, 30, 2);
        let a = ChunkIndex::new(1).unwrap();
        let b = ChunkIndex::new(2).unwrap();
        let c = ChunkIndex::new(3).unwrap();
        assert!(throttle.allow(a, 0));
        assert!(throttle.allow(b, 1));
        assert!(!throttle.allow(c, 2), "window full");
        assert!(!throttle.allow(c, 29));
        assert!(throttle.allow(c, 30), "first entry aged out");
    }

    #[test]
    fn test_mismatch_and_direct_requests_share_window() {
        let mut store = store_at(6);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(1, 30, 2);

        let bad = abs_patch(5, 7, PatchRect::new(0, 0, 1, 1), vec![9]);
        assert!(matches!(
            applier.apply(&mut store, &mut counters, &bad, 0),
            Err(PatchError::LineageMismatch { resync: Some(_), .. })
        ));

        let request = |x| ChunkResyncRequest {
            coord: ChunkCoord::new(x, 0),
            expected_base_snapshot_id: 0,
            client_snapshot_id: 0,
            reason: ResyncReason::TransferTimedOut,
        };
        assert!(applier.throttle_resync(&mut counters, request(10), 1).is_some());
        assert!(applier.throttle_resync(&mut counters, request(11), 2).is_none(), "window full");
        assert!(applier.throttle_resync(&mut counters, request(-1), 2).is_none());
        assert_eq!(counters.resync_issued, 2);
        assert_eq!(counters.resync_suppressed, 1);
    }

    #[test]
    fn test_unknown_codec_reported_before_length() {
        let mut store = store_at(5);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);

        let mut patch = ChunkPatchRect::decode(&abs_patch(5, 6, PatchRect::new(0, 0, 2, 2), vec![1; 3])).unwrap();
        patch.codec = 9;
        assert_eq!(
            applier.apply(&mut store, &mut counters, &patch.encode_to_vec(), 0),
            Err(PatchError::UnsupportedCodec(9))
        );
        assert_eq!(applier.last_error_code(), ReplicationErrorCode::UnsupportedCodec);
    }

    #[test]
    fn test_zero_throttle_settings_use_defaults() {
        let t = ResyncThrottle::new(0, 0, 0);
        assert_eq!((t.cooldown_ticks, t.window_ticks, t.max_per_window), (30, 30, 8));
    }

    #[test]
    fn test_validation_order_and_codes() {
        let mut store = store_at(5);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);

        let cases: Vec<(Vec<u8>, ReplicationErrorCode)> = vec![
            (vec![1, 2, 3], ReplicationErrorCode::MalformedPayload),
            (abs_patch(5, 5, PatchRect::new(0, 0, 1, 1), vec![1]), ReplicationErrorCode::InvalidTransferMetadata),
            (abs_patch(5, 6, PatchRect::new(60, 0, 5, 1), vec![1; 5]), ReplicationErrorCode::MalformedPayload),
            (abs_patch(5, 6, PatchRect::new(0, 0, 2, 2), vec![1; 3]), ReplicationErrorCode::MalformedPayload),
        ];
        for (payload, code) in cases {
            assert!(applier.apply(&mut store, &mut counters, &payload, 0).is_err());
            assert_eq!(applier.last_error_code(), code);
        }

        let mut no_height = ChunkPatchRect::decode(&abs_patch(5, 6, PatchRect::new(0, 0, 1, 1), vec![1])).unwrap();
        no_height.field_mask = 2;
        assert_eq!(
            applier.apply(&mut store, &mut counters, &no_height.encode_to_vec(), 0),
            Err(PatchError::MissingHeightField(2))
        );

        let mut rle = no_height.clone();
        rle.field_mask = 1;
        rle.codec = PatchCodec::RleDelta.as_u8();
        assert_eq!(
            applier.apply(&mut store, &mut counters, &rle.encode_to_vec(), 0),
            Err(PatchError::UnsupportedCodec(2))
        );
        assert_eq!(applier.last_error_code(), ReplicationErrorCode::UnsupportedCodec);

        let mut outside = rle.clone();
        outside.codec = 0;
        outside.coord = ChunkCoord::new(32, 0);
        assert_eq!(
            applier.apply(&mut store, &mut counters, &outside.encode_to_vec(), 0),
            Err(PatchError::ChunkOutOfRange(ChunkCoord::new(32, 0)))
        );

        assert_eq!(chunk(&store).versions.snapshot, 5, "no failed patch advances lineage");
        assert_eq!(counters.patch_applies, 0);
    }

    #[test]
    fn test_delta_clamps() {
        let mut store = store_at(1);
        {
            let c = store.chunk_mut(COORD.index().unwrap()).unwrap();
            c.height[0] = 250;
            c.height[1] = 3;
        }
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);
        let mut patch = ChunkPatchRect::decode(&abs_patch(1, 2, PatchRect::new(0, 0, 2, 1), vec![0, 0])).unwrap();
        patch.codec = PatchCodec::DeltaI8.as_u8();
        patch.payload = vec![20i8 as u8, -10i8 as u8];

        applier.apply(&mut store, &mut counters, &patch.encode_to_vec(), 0).unwrap();
        assert_eq!(chunk(&store).height[0], 255);
        assert_eq!(chunk(&store).height[1], 0);
    }

    #[test]
    fn test_success_marks_dirty_rect() {
        let mut store = store_at(0);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);
        let applied = applier
            .apply(&mut store, &mut counters, &abs_patch(0, 1, PatchRect::new(1, 1, 2, 2), vec![7, 8, 9, 10]), 0)
            .unwrap();

        let c = chunk(&store);
        assert!(c.dirty.contains(DirtyFlags::DERIVED | DirtyFlags::SNAPSHOT | DirtyFlags::RENDER));
        let b = c.dirty_rect.bounds().unwrap();
        assert_eq!((b.min_x, b.min_y, b.max_x, b.max_y), (1, 1, 2, 2));
        assert_eq!(applied.rect, b);
        assert_eq!(c.height[Chunk::tile_index(1, 1)], 7);
        assert_eq!(c.height[Chunk::tile_index(2, 1)], 8);
        assert_eq!(c.height[Chunk::tile_index(1, 2)], 9);
        assert_eq!(c.height[Chunk::tile_index(2, 2)], 10);
    }

    #[test]
    fn test_patch_chain_advances_lineage() {
        let mut store = store_at(1);
        let mut counters = ReplicationCounters::default();
        let mut applier = applier(10, 100, 8);
        for step in 1..=8u32 {
            let payload = abs_patch(step, step + 1, PatchRect::new(step as u8, 0, 1, 1), vec![step as u8]);
            applier.apply(&mut store, &mut counters, &payload, step as u64).unwrap();
        }
        assert_eq!(chunk(&store).versions.snapshot, 9);
        assert_eq!(counters.patch_applies, 8);
        assert_eq!(counters.patch_mismatches, 0);
    }

    #[test]
    fn test_same_patches_converge_on_independent_stores() {
        let mut a = store_at(3);
        let mut b = store_at(3);
        let mut counters = ReplicationCounters::default();
        let patches = [
            abs_patch(3, 4, PatchRect::new(1, 1, 2, 2), vec![7, 8, 9, 10]),
            abs_patch(4, 5, PatchRect::new(0, 0, 3, 1), vec![1, 2, 3]),
        ];
        for store in [&mut a, &mut b] {
            let mut applier = applier(10, 100, 8);
            for p in &patches {
                applier.apply(store, &mut counters, p, 0).unwrap();
            }
        }
        assert!(chunk(&a).same_fields(chunk(&b)));
        assert_eq!(chunk(&a).versions, chunk(&b).versions);
    }

    #[test]
    fn test_builders_reproduce_target() {
        let before = Chunk::default();
        let mut after = before.clone();
        let rect = PatchRect::new(4, 4, 3, 2);
        for (i, t) in rect.tiles().enumerate() {
            after.height[t] = 10 + i as u8;
        }

        for patch in [
            build_abs_patch(&after, COORD, 0, 1, rect).unwrap(),
            build_delta_patch(&before, &after, COORD, 0, 1, rect).unwrap(),
        ] {
            let mut store = store_at(0);
            let mut counters = ReplicationCounters::default();
            applier(10, 100, 8)
                .apply(&mut store, &mut counters, &patch.encode_to_vec(), 0)
                .unwrap();
            assert!(chunk(&store).same_fields(&after));
        }
    }

    #[test]
    fn test_delta_builder_rejects_large_steps() {
        let before = Chunk::default();
        let mut after = before.clone();
        after.height[Chunk::tile_index(1, 0)] = 200;
        assert_eq!(
            build_delta_patch(&before, &after, COORD, 0, 1, PatchRect::new(0, 0, 2, 1)),
            Err(PatchError::DeltaOutOfRange { tile: 1, delta: 200 })
        );
        assert!(build_abs_patch(&after, COORD, 0, 1, PatchRect::new(63, 0, 2, 1)).is_err());
    }

    #[test]
    fn test_delta_helpers() {
        assert_eq!(encode_delta_i8(&[10, 20], &[5, 147]), Some(vec![-5i8 as u8, 127]));
        assert_eq!(encode_delta_i8(&[0], &[128]), None);
        let mut values = [250u8, 5];
        decode_delta_i8(&mut values, &[10, -10i8 as u8]);
        assert_eq!(values, [255, 0]);
    }
}
