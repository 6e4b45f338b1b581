//! In-memory chunk store: one fixed-size vector of chunks per world.

use crate::{Chunk, ChunkIndex, ChunkStore, CHUNK_COUNT};

/// Dense in-memory world: every chunk of the grid is resident.
#[derive(Debug, Clone)]
pub struct MemoryChunkStore {
    sea_level: u8,
    chunks: Vec<Chunk>,
}

impl MemoryChunkStore {
    pub fn new(sea_level: u8) -> Self {
        Self {
            sea_level,
            chunks: (0..CHUNK_COUNT).map(|_| Chunk::default()).collect(),
        }
    }

    /// Build a store by filling each chunk from `fill(index, &mut chunk)`.
    pub fn from_fn<F>(sea_level: u8, mut fill: F) -> Self
    where
        F: FnMut(ChunkIndex, &mut Chunk),
    {
        let mut store = Self::new(sea_level);
        for (i, chunk) in store.chunks.iter_mut().enumerate() {
            if let Ok(index) = ChunkIndex::new(i) {
                fill(index, chunk);
            }
        }
        store
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkIndex, &Chunk)> {
        ChunkIndex::all().zip(self.chunks.iter())
    }

    /// Chunk indices whose replicated fields differ from `other`.
    pub fn diverging_chunks(&self, other: &MemoryChunkStore) -> Vec<ChunkIndex> {
        self.iter()
            .zip(other.chunks.iter())
            .filter(|((_, a), b)| !a.same_fields(b))
            .map(|((idx, _), _)| idx)
            .collect()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn sea_level(&self) -> u8 {
        self.sea_level
    }

    fn chunk(&self, index: ChunkIndex) -> Option<&Chunk> {
        self.chunks.get(index.as_usize())
    }

    fn chunk_mut(&mut self, index: ChunkIndex) -> Option<&mut Chunk> {
        self.chunks.get_mut(index.as_usize())
    }
}
