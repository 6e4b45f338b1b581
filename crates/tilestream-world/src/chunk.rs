//! Per-chunk field arrays, version counters and dirty tracking.

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

use crate::{CHUNK_SIZE, CHUNK_TILES};

/// Version counters for authoritative and derived per-chunk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkVersions {
    /// Advances when authoritative height data changes.
    pub height: u32,
    /// Advances when derived fields (slope, build mask) are recomputed.
    pub derived: u32,
    /// Snapshot lineage. Patches and snapshots key off this counter.
    pub snapshot: u32,
    /// Advances when render-relevant data changes.
    pub render: u32,
}

/// Per-chunk dirty flags driving recompute, snapshot and render work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    pub const NONE: Self = Self(0);
    pub const HEIGHT: Self = Self(1 << 0);
    pub const DERIVED: Self = Self(1 << 1);
    pub const SNAPSHOT: Self = Self(1 << 2);
    pub const RENDER: Self = Self(1 << 3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Inclusive tile rectangle in chunk-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub min_x: u8,
    pub min_y: u8,
    pub max_x: u8,
    pub max_y: u8,
}

/// Accumulates the bounding rect of tiles touched since the last clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect(Option<TileRect>);

impl DirtyRect {
    /// Grow the rect to include the local tile `(lx, ly)`.
    pub fn mark_tile(&mut self, lx: u8, ly: u8) {
        match &mut self.0 {
            None => {
                self.0 = Some(TileRect {
                    min_x: lx,
                    min_y: ly,
                    max_x: lx,
                    max_y: ly,
                })
            }
            Some(r) => {
                r.min_x = r.min_x.min(lx);
                r.min_y = r.min_y.min(ly);
                r.max_x = r.max_x.max(lx);
                r.max_y = r.max_y.max(ly);
            }
        }
    }

    /// Grow the rect to include `[rx, rx + rw) x [ry, ry + rh)`. Empty rects are ignored.
    pub fn mark_rect(&mut self, rx: u8, ry: u8, rw: u8, rh: u8) {
        if rw == 0 || rh == 0 {
            return;
        }
        self.mark_tile(rx, ry);
        self.mark_tile(rx.saturating_add(rw - 1), ry.saturating_add(rh - 1));
    }

    pub fn mark_all(&mut self) {
        let edge = (CHUNK_SIZE - 1) as u8;
        self.mark_tile(0, 0);
        self.mark_tile(edge, edge);
    }

    pub fn bounds(&self) -> Option<TileRect> {
        self.0
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

/// Authoritative per-tile fields that replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkField {
    Height,
    RiverMask,
    Biome,
}

impl ChunkField {
    /// Fields in wire order.
    pub const ALL: [ChunkField; 3] = [ChunkField::Height, ChunkField::RiverMask, ChunkField::Biome];
}

/// One chunk: structure-of-arrays tile fields plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub height: Box<[u8; CHUNK_TILES]>,
    pub river_mask: Box<[u8; CHUNK_TILES]>,
    pub biome: Box<[u8; CHUNK_TILES]>,
    pub versions: ChunkVersions,
    pub dirty: DirtyFlags,
    pub dirty_rect: DirtyRect,
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            height: Box::new([0; CHUNK_TILES]),
            river_mask: Box::new([0; CHUNK_TILES]),
            biome: Box::new([0; CHUNK_TILES]),
            versions: ChunkVersions::default(),
            dirty: DirtyFlags::NONE,
            dirty_rect: DirtyRect::default(),
        }
    }
}

impl Chunk {
    /// Tile index inside a chunk: `lx + ly * CHUNK_SIZE`.
    pub const fn tile_index(lx: usize, ly: usize) -> usize {
        lx + ly * CHUNK_SIZE
    }

    pub fn field(&self, field: ChunkField) -> &[u8; CHUNK_TILES] {
        match field {
            ChunkField::Height => &self.height,
            ChunkField::RiverMask => &self.river_mask,
            ChunkField::Biome => &self.biome,
        }
    }

    pub fn field_mut(&mut self, field: ChunkField) -> &mut [u8; CHUNK_TILES] {
        match field {
            ChunkField::Height => &mut self.height,
            ChunkField::RiverMask => &mut self.river_mask,
            ChunkField::Biome => &mut self.biome,
        }
    }

    /// True when every replicated field matches byte-for-byte.
    pub fn same_fields(&self, other: &Chunk) -> bool {
        self.height == other.height && self.river_mask == other.river_mask && self.biome == other.biome
    }

    pub fn is_sea(&self, lx: usize, ly: usize, sea_level: u8) -> bool {
        let idx = Self::tile_index(lx, ly);
        self.river_mask[idx] == 0 && self.height[idx] <= sea_level
    }

    /// Clear dirty flags and the dirty rect after consumers have caught up.
    pub fn clear_dirty(&mut self) {
        self.dirty = DirtyFlags::NONE;
        self.dirty_rect.clear();
    }
}
