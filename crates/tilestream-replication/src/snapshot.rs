//! Client-side snapshot ingestion: fragments in, whole chunks out.

use tilestream_protocol::{frag_count, ChunkSnapshotFrag, WireError, WireMessage, SNAPSHOT_CODEC_COMPRESSED};
use tilestream_world::{ChunkCoord, ChunkIndex, ChunkStore};
use tracing::{debug, warn};

use crate::compress::Compressor;
use crate::counters::ReplicationCounters;
use crate::reassembly::{transfer_key, ReassemblyError, ReassemblyManager};
use crate::snapshot_codec::{self, max_decompressed_size, CodecError, FieldMask};
use crate::ReplicationErrorCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed fragment: {0}")]
    Malformed(#[from] WireError),
    #[error("unsupported snapshot codec {0}")]
    UnsupportedCodec(u16),
    #[error("invalid transfer metadata: {0}")]
    InvalidTransferMetadata(String),
    #[error("fragment chunk {0} outside the grid")]
    ChunkOutOfRange(ChunkCoord),
    #[error("could not start reassembly: {0}")]
    ReassemblyCreate(ReassemblyError),
    #[error("could not add fragment: {0}")]
    ReassemblyAdd(ReassemblyError),
    #[error("snapshot decode failed for chunk {chunk}: {source}")]
    Decode { chunk: ChunkIndex, source: CodecError },
    #[error("snapshot {incoming} is older than local snapshot {local}")]
    StaleSnapshot { local: u32, incoming: u32 },
    #[error("snapshot apply failed: {0}")]
    Apply(CodecError),
}

impl SnapshotError {
    pub fn code(&self) -> ReplicationErrorCode {
        match self {
            SnapshotError::Malformed(_) | SnapshotError::ChunkOutOfRange(_) => ReplicationErrorCode::MalformedPayload,
            SnapshotError::UnsupportedCodec(_) => ReplicationErrorCode::UnsupportedCodec,
            SnapshotError::InvalidTransferMetadata(_) => ReplicationErrorCode::InvalidTransferMetadata,
            SnapshotError::ReassemblyCreate(_) => ReplicationErrorCode::ReassemblyCreateFailed,
            SnapshotError::ReassemblyAdd(_) => ReplicationErrorCode::ReassemblyAddFailed,
            SnapshotError::Decode { .. } => ReplicationErrorCode::DecodeFailed,
            SnapshotError::StaleSnapshot { .. } | SnapshotError::Apply(_) => ReplicationErrorCode::ApplyFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Accepted; the transfer is still incomplete.
    Pending,
    /// The last fragment arrived and the chunk was committed.
    Applied { chunk: ChunkIndex, snapshot_id: u32 },
}

fn metadata(msg: String) -> SnapshotError {
    SnapshotError::InvalidTransferMetadata(msg)
}

/// Drives fragments through reassembly and commits completed snapshots.
pub struct SnapshotApplier {
    compressor: Box<dyn Compressor + Send>,
    frag_payload_cap: usize,
    reassembly: ReassemblyManager,
    scratch: Vec<u8>,
    last_error: ReplicationErrorCode,
}

impl SnapshotApplier {
    pub fn new(compressor: Box<dyn Compressor + Send>, frag_payload_cap: usize, timeout_ticks: u64) -> Self {
        Self {
            compressor,
            frag_payload_cap,
            reassembly: ReassemblyManager::new(timeout_ticks),
            scratch: vec![0u8; max_decompressed_size(FieldMask::ALL)],
            last_error: ReplicationErrorCode::None,
        }
    }

    pub fn last_error_code(&self) -> ReplicationErrorCode {
        self.last_error
    }

    pub fn reassembly(&self) -> &ReassemblyManager {
        &self.reassembly
    }

    /// Evict stalled transfers; returns how many were dropped.
    pub fn evict_expired_transfers(&mut self, counters: &mut ReplicationCounters, now: u64) -> usize {
        let evicted = self.reassembly.evict_expired(now);
        counters.timeout_evictions += evicted as u64;
        evicted
    }

    pub fn on_fragment<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        counters: &mut ReplicationCounters,
        payload: &[u8],
        now: u64,
    ) -> Result<FragmentOutcome, SnapshotError> {
        let result = self.on_fragment_inner(store, counters, payload, now);
        self.last_error = match &result {
            Ok(_) => ReplicationErrorCode::None,
            Err(e) => {
                debug!(code = %e.code(), error = %e, "fragment rejected");
                e.code()
            }
        };
        result
    }

    fn on_fragment_inner<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        counters: &mut ReplicationCounters,
        payload: &[u8],
        now: u64,
    ) -> Result<FragmentOutcome, SnapshotError> {
        let frag = ChunkSnapshotFrag::decode(payload)?;
        counters.fragments_received += 1;

        if frag.codec != SNAPSHOT_CODEC_COMPRESSED {
            return Err(SnapshotError::UnsupportedCodec(frag.codec));
        }
        let cap = self.frag_payload_cap;
        let total_len = frag.total_len as usize;
        if cap == 0 {
            return Err(metadata("fragment payload capacity is zero".into()));
        }
        if total_len == 0 || frag.total_len > i32::MAX as u32 {
            return Err(metadata(format!("total_len {}", frag.total_len)));
        }
        if frag.frag_count == 0 {
            return Err(metadata("frag_count is zero".into()));
        }
        let frag_len = frag.frag_len();
        if frag_len == 0 || frag_len > cap {
            return Err(metadata(format!("frag_len {frag_len} outside 1..={cap}")));
        }
        if frag_count(total_len, cap) != frag.frag_count as usize {
            return Err(metadata(format!(
                "{} fragments of {cap} bytes do not carry {total_len}",
                frag.frag_count
            )));
        }
        let chunk = frag.coord.index().ok_or(SnapshotError::ChunkOutOfRange(frag.coord))?;

        let key = transfer_key(chunk, frag.snapshot_id);
        let buffer = self
            .reassembly
            .try_get_or_create(key, total_len, frag.frag_count as usize, cap, now)
            .map_err(SnapshotError::ReassemblyCreate)?;

        let offset = frag.frag_index as usize * cap;
        let end = offset + frag_len;
        if end > total_len {
            self.reassembly.remove(key);
            return Err(metadata(format!("fragment range {offset}..{end} past total_len {total_len}")));
        }

        if let Err(e) = buffer.try_add(frag.frag_index as usize, &frag.payload, offset) {
            counters.reassembly_failures += 1;
            self.reassembly.remove(key);
            warn!(chunk = %frag.coord, snapshot = frag.snapshot_id, error = %e, "fragment add failed, transfer dropped");
            return Err(SnapshotError::ReassemblyAdd(e));
        }
        let complete = buffer.is_complete();
        let received = buffer.received_bytes();
        self.reassembly.touch(key, now);

        // Older transfers for the chunk only go once a newer one holds data.
        let superseded = self.reassembly.remove_superseded(chunk, frag.snapshot_id);
        if superseded > 0 {
            debug!(chunk = %frag.coord, snapshot = frag.snapshot_id, superseded, "dropped older transfers");
        }

        if !complete {
            return Ok(FragmentOutcome::Pending);
        }

        let result = self.commit(store, counters, key, chunk, frag.snapshot_id, received, total_len);
        self.reassembly.remove(key);
        result
    }

    /// Decode and write a completed transfer. Every failure here counts
    /// as a reassembly failure.
    #[allow(clippy::too_many_arguments)]
    fn commit<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        counters: &mut ReplicationCounters,
        key: u64,
        chunk: ChunkIndex,
        snapshot_id: u32,
        received: usize,
        total_len: usize,
    ) -> Result<FragmentOutcome, SnapshotError> {
        match self.commit_inner(store, key, chunk, snapshot_id, received, total_len) {
            Ok(outcome) => {
                counters.snapshots_applied += 1;
                debug!(chunk = %chunk.coord(), snapshot = snapshot_id, bytes = total_len, "snapshot applied");
                Ok(outcome)
            }
            Err(e) => {
                counters.reassembly_failures += 1;
                warn!(chunk = %chunk.coord(), snapshot = snapshot_id, error = %e, "snapshot commit failed");
                Err(e)
            }
        }
    }

    fn commit_inner<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        key: u64,
        chunk: ChunkIndex,
        snapshot_id: u32,
        received: usize,
        total_len: usize,
    ) -> Result<FragmentOutcome, SnapshotError> {
        if received != total_len {
            return Err(metadata(format!("received {received} bytes, expected {total_len}")));
        }
        let Some(buffer) = self.reassembly.get(key) else {
            return Err(metadata("transfer vanished before commit".into()));
        };

        let (header, fields) = snapshot_codec::decode(buffer.as_bytes(), self.compressor.as_ref(), &mut self.scratch)
            .map_err(|source| SnapshotError::Decode { chunk, source })?;
        if header.snapshot_id != snapshot_id {
            return Err(metadata(format!(
                "payload snapshot {} does not match fragment snapshot {snapshot_id}",
                header.snapshot_id
            )));
        }

        let target = store.chunk_mut(chunk).ok_or(SnapshotError::ChunkOutOfRange(chunk.coord()))?;
        if header.snapshot_id < target.versions.snapshot {
            return Err(SnapshotError::StaleSnapshot {
                local: target.versions.snapshot,
                incoming: header.snapshot_id,
            });
        }
        snapshot_codec::apply_decoded(&header, fields, target).map_err(SnapshotError::Apply)?;
        Ok(FragmentOutcome::Applied { chunk, snapshot_id })
    }
}
