//! Tilestream World -- chunk store contract shared by server and client.
//!
//! The replication layer treats chunk storage as an opaque read/write store
//! keyed by chunk index. This crate exposes only what replication needs:
//! world dimensions, chunk coordinates, per-chunk fields, version counters
//! and dirty tracking, plus an in-memory store.

pub mod chunk;
pub mod memory;

pub use chunk::{Chunk, ChunkField, ChunkVersions, DirtyFlags, DirtyRect, TileRect};
pub use memory::MemoryChunkStore;

use serde::{Deserialize, Serialize};

/// World width in tiles.
pub const MAP_W: usize = 2048;

/// World height in tiles.
pub const MAP_H: usize = 2048;

/// Chunk edge length in tiles.
pub const CHUNK_SIZE: usize = 64;

/// Chunks along the X axis.
pub const CHUNKS_W: usize = MAP_W / CHUNK_SIZE;

/// Chunks along the Y axis.
pub const CHUNKS_H: usize = MAP_H / CHUNK_SIZE;

/// Total chunk count (32 x 32).
pub const CHUNK_COUNT: usize = CHUNKS_W * CHUNKS_H;

/// Tiles per chunk, and the byte length of every per-tile field array.
pub const CHUNK_TILES: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Height is u8. Sea is derived: height <= sea level and not river.
pub const DEFAULT_SEA_LEVEL: u8 = 96;

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("chunk index {index} out of range (max {max})")]
    ChunkIndexOutOfRange { index: usize, max: usize },
    #[error("chunk coord ({x}, {y}) outside the {w}x{h} grid")]
    ChunkCoordOutOfRange { x: i32, y: i32, w: usize, h: usize },
}

pub type Result<T> = std::result::Result<T, WorldError>;

/// Signed chunk coordinate as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i16,
    pub y: i16,
}

impl ChunkCoord {
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// Linear index, or `None` when the coordinate lies outside the grid.
    pub fn index(&self) -> Option<ChunkIndex> {
        if self.x < 0 || self.y < 0 {
            return None;
        }
        let (x, y) = (self.x as usize, self.y as usize);
        if x >= CHUNKS_W || y >= CHUNKS_H {
            return None;
        }
        Some(ChunkIndex((x + y * CHUNKS_W) as u16))
    }

    /// Like [`ChunkCoord::index`] but reports the offending coordinate.
    pub fn try_index(&self) -> Result<ChunkIndex> {
        self.index().ok_or(WorldError::ChunkCoordOutOfRange {
            x: self.x as i32,
            y: self.y as i32,
            w: CHUNKS_W,
            h: CHUNKS_H,
        })
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Linear chunk index: `x + y * CHUNKS_W`. Always in `0..CHUNK_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkIndex(u16);

impl ChunkIndex {
    pub fn new(index: usize) -> Result<Self> {
        if index >= CHUNK_COUNT {
            return Err(WorldError::ChunkIndexOutOfRange {
                index,
                max: CHUNK_COUNT - 1,
            });
        }
        Ok(Self(index as u16))
    }

    /// Index from grid position. Callers guarantee `x < CHUNKS_W`, `y < CHUNKS_H`.
    pub(crate) const fn from_grid(x: usize, y: usize) -> Self {
        Self((x + y * CHUNKS_W) as u16)
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn coord(self) -> ChunkCoord {
        let i = self.0 as usize;
        ChunkCoord {
            x: (i % CHUNKS_W) as i16,
            y: (i / CHUNKS_W) as i16,
        }
    }

    /// Iterate every chunk index in linear order.
    pub fn all() -> impl Iterator<Item = ChunkIndex> {
        (0..CHUNK_COUNT as u16).map(ChunkIndex)
    }

    /// Iterate the chunks of the Chebyshev square of `radius` around
    /// `(cx, cy)`, clipped to the grid, in row-major order.
    pub fn square(cx: i32, cy: i32, radius: i32) -> impl Iterator<Item = ChunkIndex> {
        let (min_x, max_x) = clip_span(cx, radius, CHUNKS_W);
        let (min_y, max_y) = clip_span(cy, radius, CHUNKS_H);
        (min_y..=max_y)
            .flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
            .map(|(x, y)| Self::from_grid(x as usize, y as usize))
    }
}

/// Clip `[c - r, c + r]` to `[0, len - 1]`. Returns an empty span (min > max)
/// when the square lies entirely outside the grid.
pub fn clip_span(c: i32, r: i32, len: usize) -> (i32, i32) {
    let min = c.saturating_sub(r).max(0);
    let max = c.saturating_add(r).min(len as i32 - 1);
    (min, max)
}

impl std::fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk store contract consumed by the replication appliers.
///
/// Writes are serialized per chunk by the caller; the store provides no
/// locking of its own.
pub trait ChunkStore {
    fn sea_level(&self) -> u8;
    fn chunk(&self, index: ChunkIndex) -> Option<&Chunk>;
    fn chunk_mut(&mut self, index: ChunkIndex) -> Option<&mut Chunk>;

    /// Replace a chunk wholesale.
    fn set_chunk(&mut self, index: ChunkIndex, chunk: Chunk) -> Result<()> {
        match self.chunk_mut(index) {
            Some(slot) => {
                *slot = chunk;
                Ok(())
            }
            None => Err(WorldError::ChunkIndexOutOfRange {
                index: index.as_usize(),
                max: CHUNK_COUNT - 1,
            }),
        }
    }
}
