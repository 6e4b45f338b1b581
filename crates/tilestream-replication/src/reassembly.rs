//! In-flight fragmented transfers.
//!
//! A [`ReassemblyBuffer`] collects the fragments of one transfer. The
//! [`ReassemblyManager`] keys buffers by `(chunk, snapshot)`, tracks when
//! each was last touched, and evicts transfers that stall. Eviction is
//! driven by the owner's tick loop; nothing here runs on its own.

use std::collections::HashMap;

use tilestream_world::ChunkIndex;
use tracing::debug;

/// Released buffers kept for reuse.
const MAX_POOLED_BUFFERS: usize = 32;

/// Pack a transfer key: `chunk_index | snapshot_id << 32`.
pub const fn transfer_key(chunk: ChunkIndex, snapshot_id: u32) -> u64 {
    chunk.as_usize() as u64 | (snapshot_id as u64) << 32
}

const fn key_chunk(key: u64) -> u64 {
    key & 0xFFFF_FFFF
}

const fn key_snapshot(key: u64) -> u32 {
    (key >> 32) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("invalid transfer shape: total_len {total_len}, frag_count {frag_count}, frag_cap {frag_cap}")]
    InvalidShape {
        total_len: usize,
        frag_count: usize,
        frag_cap: usize,
    },
    #[error("transfer already in flight with total_len {total_len}, frag_count {frag_count}")]
    ShapeMismatch { total_len: usize, frag_count: usize },
    #[error("fragment index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("fragment offset {offset} + {len} overflows")]
    OffsetOverflow { offset: usize, len: usize },
    #[error("fragment range {offset}..{end} exceeds total_len {total_len}")]
    RangeOutOfBounds { offset: usize, end: usize, total_len: usize },
    #[error("fragment {index} at offset {got}, plan puts it at {expected}")]
    OffsetMismatch { index: usize, expected: usize, got: usize },
    #[error("fragment {index} carries {got} bytes, plan expects {expected}")]
    LengthMismatch { index: usize, expected: usize, got: usize },
    #[error("duplicate fragment {index} with length {got}, first copy had {first}")]
    DuplicateLengthMismatch { index: usize, first: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same index and length seen before; nothing changed.
    Duplicate,
}

/// Fixed-size byte buffer plus a per-fragment received-length table.
/// Fragment `i` must sit at `i * frag_cap`; all but the last are exactly
/// `frag_cap` bytes, so no two fragments overlap.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    data: Vec<u8>,
    frag_cap: usize,
    frag_lens: Vec<Option<usize>>,
    received_count: usize,
    received_bytes: usize,
}

impl ReassemblyBuffer {
    pub fn new(total_len: usize, frag_count: usize, frag_cap: usize) -> Result<Self, ReassemblyError> {
        let mut buf = Self {
            data: Vec::new(),
            frag_cap: 0,
            frag_lens: Vec::new(),
            received_count: 0,
            received_bytes: 0,
        };
        buf.reset(total_len, frag_count, frag_cap)?;
        Ok(buf)
    }

    /// Reinitialize for a new transfer, keeping allocations.
    fn reset(&mut self, total_len: usize, frag_count: usize, frag_cap: usize) -> Result<(), ReassemblyError> {
        check_shape(total_len, frag_count, frag_cap)?;
        self.frag_cap = frag_cap;
        self.data.clear();
        self.data.resize(total_len, 0);
        self.frag_lens.clear();
        self.frag_lens.resize(frag_count, None);
        self.received_count = 0;
        self.received_bytes = 0;
        Ok(())
    }

    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    pub fn frag_count(&self) -> usize {
        self.frag_lens.len()
    }

    pub fn frag_cap(&self) -> usize {
        self.frag_cap
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Length the plan assigns to fragment `index`.
    fn expected_len(&self, index: usize) -> usize {
        let offset = index * self.frag_cap;
        self.frag_cap.min(self.data.len() - offset)
    }

    pub fn try_add(&mut self, frag_index: usize, payload: &[u8], offset: usize) -> Result<AddOutcome, ReassemblyError> {
        let count = self.frag_lens.len();
        if frag_index >= count {
            return Err(ReassemblyError::IndexOutOfRange { index: frag_index, count });
        }
        let end = offset.checked_add(payload.len()).ok_or(ReassemblyError::OffsetOverflow {
            offset,
            len: payload.len(),
        })?;
        if end > self.data.len() {
            return Err(ReassemblyError::RangeOutOfBounds {
                offset,
                end,
                total_len: self.data.len(),
            });
        }

        let expected_offset = frag_index * self.frag_cap;
        if offset != expected_offset {
            return Err(ReassemblyError::OffsetMismatch {
                index: frag_index,
                expected: expected_offset,
                got: offset,
            });
        }

        if let Some(first) = self.frag_lens[frag_index] {
            if first == payload.len() {
                return Ok(AddOutcome::Duplicate);
            }
            return Err(ReassemblyError::DuplicateLengthMismatch {
                index: frag_index,
                first,
                got: payload.len(),
            });
        }
        let expected_len = self.expected_len(frag_index);
        if payload.len() != expected_len {
            return Err(ReassemblyError::LengthMismatch {
                index: frag_index,
                expected: expected_len,
                got: payload.len(),
            });
        }

        self.data[offset..end].copy_from_slice(payload);
        self.frag_lens[frag_index] = Some(payload.len());
        self.received_count += 1;
        self.received_bytes += payload.len();
        Ok(AddOutcome::Added)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.frag_lens.len()
    }

    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A transfer needs exactly `ceil(total_len / frag_cap)` fragments.
fn check_shape(total_len: usize, frag_count: usize, frag_cap: usize) -> Result<(), ReassemblyError> {
    if total_len == 0 || frag_cap == 0 || total_len.div_ceil(frag_cap) != frag_count {
        return Err(ReassemblyError::InvalidShape {
            total_len,
            frag_count,
            frag_cap,
        });
    }
    Ok(())
}

#[derive(Debug)]
struct Transfer {
    buffer: ReassemblyBuffer,
    last_touched: u64,
}

/// Keyed store of in-flight transfers with tick-based eviction.
#[derive(Debug)]
pub struct ReassemblyManager {
    timeout_ticks: u64,
    transfers: HashMap<u64, Transfer>,
    pool: Vec<ReassemblyBuffer>,
}

impl ReassemblyManager {
    /// `timeout_ticks == 0` selects the era default.
    pub fn new(timeout_ticks: u64) -> Self {
        let timeout_ticks = if timeout_ticks == 0 {
            tilestream_protocol::CURRENT_ERA.transfer_timeout_ticks
        } else {
            timeout_ticks
        };
        Self {
            timeout_ticks,
            transfers: HashMap::new(),
            pool: Vec::new(),
        }
    }

    pub fn timeout_ticks(&self) -> u64 {
        self.timeout_ticks
    }

    /// Existing buffer for `key` (touched), or a fresh one.
    pub fn try_get_or_create(
        &mut self,
        key: u64,
        total_len: usize,
        frag_count: usize,
        frag_cap: usize,
        now: u64,
    ) -> Result<&mut ReassemblyBuffer, ReassemblyError> {
        check_shape(total_len, frag_count, frag_cap)?;

        if !self.transfers.contains_key(&key) {
            let buffer = self.take_buffer(total_len, frag_count, frag_cap)?;
            self.transfers.insert(
                key,
                Transfer {
                    buffer,
                    last_touched: now,
                },
            );
        }

        let Some(transfer) = self.transfers.get_mut(&key) else {
            return Err(ReassemblyError::InvalidShape {
                total_len,
                frag_count,
                frag_cap,
            });
        };
        let buf = &transfer.buffer;
        if buf.total_len() != total_len || buf.frag_count() != frag_count || buf.frag_cap() != frag_cap {
            return Err(ReassemblyError::ShapeMismatch {
                total_len: transfer.buffer.total_len(),
                frag_count: transfer.buffer.frag_count(),
            });
        }
        transfer.last_touched = now;
        Ok(&mut transfer.buffer)
    }

    fn take_buffer(
        &mut self,
        total_len: usize,
        frag_count: usize,
        frag_cap: usize,
    ) -> Result<ReassemblyBuffer, ReassemblyError> {
        let pos = self.pool.iter().position(|b| b.capacity() >= total_len);
        match pos.map(|i| self.pool.swap_remove(i)).or_else(|| self.pool.pop()) {
            Some(mut buf) => {
                buf.reset(total_len, frag_count, frag_cap)?;
                Ok(buf)
            }
            None => ReassemblyBuffer::new(total_len, frag_count, frag_cap),
        }
    }

    fn release(&mut self, buffer: ReassemblyBuffer) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            self.pool.push(buffer);
        }
    }

    pub fn get(&self, key: u64) -> Option<&ReassemblyBuffer> {
        self.transfers.get(&key).map(|t| &t.buffer)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut ReassemblyBuffer> {
        self.transfers.get_mut(&key).map(|t| &mut t.buffer)
    }

    pub fn touch(&mut self, key: u64, now: u64) -> bool {
        match self.transfers.get_mut(&key) {
            Some(t) => {
                t.last_touched = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: u64) -> bool {
        match self.transfers.remove(&key) {
            Some(t) => {
                self.release(t.buffer);
                true
            }
            None => false,
        }
    }

    /// Drop every transfer with `now - last_touched >= timeout`.
    pub fn evict_expired(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ticks;
        let expired: Vec<u64> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_sub(t.last_touched) >= timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.remove(*key);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), remaining = self.transfers.len(), "evicted stalled transfers");
        }
        expired.len()
    }

    /// Drop in-flight transfers for `chunk` with an older snapshot id.
    pub fn remove_superseded(&mut self, chunk: ChunkIndex, snapshot_id: u32) -> usize {
        let chunk_bits = chunk.as_usize() as u64;
        let stale: Vec<u64> = self
            .transfers
            .keys()
            .copied()
            .filter(|&k| key_chunk(k) == chunk_bits && key_snapshot(k) < snapshot_id)
            .collect();
        for key in &stale {
            self.remove(*key);
        }
        stale.len()
    }

    /// Whether any transfer for `chunk` is in flight.
    pub fn contains_chunk(&self, chunk: ChunkIndex) -> bool {
        let chunk_bits = chunk.as_usize() as u64;
        self.transfers.keys().any(|&k| key_chunk(k) == chunk_bits)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Bytes held by in-flight transfers.
    pub fn buffered_bytes(&self) -> usize {
        self.transfers.values().map(|t| t.buffer.total_len()).sum()
    }

    pub fn pooled_buffers(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn idx(i: usize) -> ChunkIndex {
        ChunkIndex::new(i).unwrap()
    }

    #[test]
    fn test_transfer_key_packing() {
        let key = transfer_key(idx(5), 7);
        assert_eq!(key, 5 | (7u64 << 32));
        assert_eq!(key_chunk(key), 5);
        assert_eq!(key_snapshot(key), 7);
    }

    #[test]
    fn test_buffer_out_of_order_and_duplicates() {
        let mut buf = ReassemblyBuffer::new(6, 3, 2).unwrap();
        assert_eq!(buf.try_add(2, b"ef", 4).unwrap(), AddOutcome::Added);
        assert_eq!(buf.try_add(0, b"ab", 0).unwrap(), AddOutcome::Added);
        assert_eq!(buf.try_add(0, b"xy", 0).unwrap(), AddOutcome::Duplicate);
        assert!(!buf.is_complete());

        assert_eq!(
            buf.try_add(1, b"cdz", 2).unwrap_err(),
            ReassemblyError::LengthMismatch { index: 1, expected: 2, got: 3 }
        );
        assert_eq!(&buf.as_bytes()[4..], b"ef", "overlapping write rejected");
        assert_eq!(buf.try_add(1, b"cd", 2).unwrap(), AddOutcome::Added);
        assert!(buf.is_complete());
        assert_eq!(buf.as_bytes(), b"abcdef");
        assert_eq!(buf.received_bytes(), 6);
    }

    #[test]
    fn test_misplaced_fragment_rejected() {
        let mut buf = ReassemblyBuffer::new(10, 3, 4).unwrap();
        buf.try_add(0, b"abcd", 0).unwrap();
        assert_eq!(
            buf.try_add(1, b"xyzw", 2).unwrap_err(),
            ReassemblyError::OffsetMismatch { index: 1, expected: 4, got: 2 }
        );
        assert_eq!(
            buf.try_add(1, b"efg", 4).unwrap_err(),
            ReassemblyError::LengthMismatch { index: 1, expected: 4, got: 3 }
        );
        assert_eq!(&buf.as_bytes()[..4], b"abcd");
        assert_eq!(buf.received_bytes(), 4);

        buf.try_add(1, b"efgh", 4).unwrap();
        buf.try_add(2, b"ij", 8).unwrap();
        assert!(buf.is_complete());
        assert_eq!(buf.received_bytes(), 10);
    }

    #[test]
    fn test_duplicate_length_mismatch_rejected() {
        let mut buf = ReassemblyBuffer::new(6, 3, 2).unwrap();
        buf.try_add(0, b"ab", 0).unwrap();
        assert_eq!(
            buf.try_add(0, b"a", 0).unwrap_err(),
            ReassemblyError::DuplicateLengthMismatch { index: 0, first: 2, got: 1 }
        );
        assert_eq!(&buf.as_bytes()[..2], b"ab");
    }

    #[test]
    fn test_invalid_index_and_offset() {
        let mut buf = ReassemblyBuffer::new(6, 3, 2).unwrap();
        assert!(matches!(buf.try_add(3, b"a", 0), Err(ReassemblyError::IndexOutOfRange { .. })));
        assert!(matches!(
            buf.try_add(0, b"ab", usize::MAX),
            Err(ReassemblyError::OffsetOverflow { .. })
        ));
        assert!(ReassemblyBuffer::new(0, 1, 4).is_err());
        assert!(ReassemblyBuffer::new(1, 0, 4).is_err());
        assert!(ReassemblyBuffer::new(10, 2, 4).is_err(), "too few fragments");
        assert!(ReassemblyBuffer::new(10, 4, 4).is_err(), "too many fragments");
        assert!(ReassemblyBuffer::new(10, 1, 0).is_err());
        assert!(ReassemblyBuffer::new(10, 3, 4).is_ok());
    }

    #[test]
    fn test_manager_get_or_create_is_idempotent() {
        let mut mgr = ReassemblyManager::new(5);
        let key = transfer_key(idx(1), 1);
        mgr.try_get_or_create(key, 6, 3, 2, 0).unwrap().try_add(0, b"ab", 0).unwrap();
        let again = mgr.try_get_or_create(key, 6, 3, 2, 1).unwrap();
        assert_eq!(&again.as_bytes()[..2], b"ab");
        assert_eq!(mgr.len(), 1);

        assert!(matches!(
            mgr.try_get_or_create(key, 5, 3, 2, 1),
            Err(ReassemblyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_eviction_boundary_is_inclusive() {
        let mut mgr = ReassemblyManager::new(2);
        mgr.try_get_or_create(transfer_key(idx(0), 1), 10, 1, 16, 0).unwrap();
        assert_eq!(mgr.evict_expired(1), 0);
        assert_eq!(mgr.evict_expired(2), 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_touch_postpones_eviction() {
        let mut mgr = ReassemblyManager::new(2);
        let key = transfer_key(idx(0), 1);
        mgr.try_get_or_create(key, 10, 1, 16, 0).unwrap();
        assert!(mgr.touch(key, 1));
        assert_eq!(mgr.evict_expired(2), 0);
        assert_eq!(mgr.evict_expired(3), 1);
        assert!(!mgr.touch(key, 4));
    }

    #[test]
    fn test_churn_evicts_everything() {
        let mut mgr = ReassemblyManager::new(2);
        for i in 0..64 {
            mgr.try_get_or_create(transfer_key(idx(i), 1), 128, 2, 64, 0).unwrap();
        }
        assert_eq!(mgr.buffered_bytes(), 64 * 128);
        assert_eq!(mgr.evict_expired(1), 0);
        assert_eq!(mgr.evict_expired(2), 64);
        assert_eq!(mgr.buffered_bytes(), 0);
    }

    #[test]
    fn test_memory_stays_flat_across_rounds() {
        let mut mgr = ReassemblyManager::new(1);
        for round in 0..32u64 {
            for i in 0..32 {
                mgr.try_get_or_create(transfer_key(idx(i), round as u32), 256, 4, 64, round).unwrap();
            }
            assert_eq!(mgr.evict_expired(round + 1), 32);
            assert!(mgr.pooled_buffers() <= MAX_POOLED_BUFFERS);
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_pooled_buffer_is_clean() {
        let mut mgr = ReassemblyManager::new(10);
        let a = transfer_key(idx(0), 1);
        mgr.try_get_or_create(a, 4, 2, 2, 0).unwrap().try_add(0, b"zz", 0).unwrap();
        mgr.remove(a);
        assert_eq!(mgr.pooled_buffers(), 1);

        let b = transfer_key(idx(1), 1);
        let buf = mgr.try_get_or_create(b, 4, 2, 2, 0).unwrap();
        assert_eq!(buf.as_bytes(), &[0, 0, 0, 0]);
        assert!(!buf.is_complete());
        assert_eq!(mgr.pooled_buffers(), 0);
    }

    #[test]
    fn test_remove_superseded_keeps_newer() {
        let mut mgr = ReassemblyManager::new(10);
        mgr.try_get_or_create(transfer_key(idx(3), 1), 4, 1, 4, 0).unwrap();
        mgr.try_get_or_create(transfer_key(idx(3), 2), 4, 1, 4, 0).unwrap();
        mgr.try_get_or_create(transfer_key(idx(3), 5), 4, 1, 4, 0).unwrap();
        mgr.try_get_or_create(transfer_key(idx(4), 1), 4, 1, 4, 0).unwrap();

        assert_eq!(mgr.remove_superseded(idx(3), 5), 2);
        assert!(mgr.get(transfer_key(idx(3), 5)).is_some());
        assert!(mgr.get(transfer_key(idx(4), 1)).is_some());
        assert_eq!(mgr.len(), 2);

        assert!(mgr.contains_chunk(idx(3)));
        assert!(!mgr.contains_chunk(idx(5)));
    }

    proptest! {
        #[test]
        fn arrival_order_and_duplicates_do_not_matter(
            data in proptest::collection::vec(any::<u8>(), 1..400),
            cap in 1usize..64,
            order_seed in proptest::collection::vec(any::<usize>(), 0..64),
        ) {
            let count = data.len().div_ceil(cap);
            let mut order: Vec<usize> = (0..count).collect();
            for (i, s) in order_seed.iter().enumerate() {
                let a = i % count;
                let b = s % count;
                order.swap(a, b);
            }
            // Re-deliver the first few fragments.
            let mut deliveries = order.clone();
            deliveries.extend(order.iter().take(3));

            let mut buf = ReassemblyBuffer::new(data.len(), count, cap).unwrap();
            for i in deliveries {
                let start = i * cap;
                let end = (start + cap).min(data.len());
                buf.try_add(i, &data[start..end], start).unwrap();
            }
            prop_assert!(buf.is_complete());
            prop_assert_eq!(buf.received_bytes(), data.len());
            prop_assert_eq!(buf.as_bytes(), &data[..]);
        }
    }
}
