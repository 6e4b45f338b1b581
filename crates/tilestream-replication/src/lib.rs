//! Tilestream Replication -- convergent chunk streaming.
//!
//! Server side: the [`ChunkStreamScheduler`] picks what to send under a
//! per-tick budget, the snapshot codec packs chunk fields, and patch
//! builders describe small edits.
//!
//! Client side: the [`SnapshotApplier`] reassembles fragments and commits
//! whole chunks; the [`PatchApplier`] applies rect edits under lineage
//! checks and throttles resync requests on mismatch.
//!
//! Every component is synchronous and owned by one connection. Counters
//! are passed in explicitly so the caller decides how they aggregate.

use serde::{Deserialize, Serialize};
use tilestream_protocol::CURRENT_ERA;

pub mod compress;
pub mod counters;
pub mod patch;
pub mod reassembly;
pub mod scheduler;
pub mod snapshot;
pub mod snapshot_codec;

pub use compress::{compressor_by_name, CompressError, Compressor, RleCompressor, StoredCompressor};
pub use counters::ReplicationCounters;
pub use patch::{PatchApplied, PatchApplier, PatchCodec, PatchError, PatchRect, ResyncThrottle};
pub use reassembly::{transfer_key, AddOutcome, ReassemblyBuffer, ReassemblyError, ReassemblyManager};
pub use scheduler::{ChunkStreamScheduler, SchedulerConfig, TickBudget};
pub use snapshot::{FragmentOutcome, SnapshotApplier, SnapshotError};
pub use snapshot_codec::{CodecError, FieldMask, SnapshotHeader};

#[cfg(feature = "zstd")]
pub use compress::ZstdCompressor;

/// Per-connection replication tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub transfer_timeout_ticks: u64,
    pub resync_cooldown_ticks: u64,
    pub resync_window_ticks: u64,
    pub resync_max_per_window: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ticks: CURRENT_ERA.transfer_timeout_ticks,
            resync_cooldown_ticks: CURRENT_ERA.resync_cooldown_ticks,
            resync_window_ticks: CURRENT_ERA.resync_window_ticks,
            resync_max_per_window: CURRENT_ERA.resync_max_per_window,
        }
    }
}

/// Closed taxonomy of replication failures, kept as a last-operation
/// diagnostic alongside the typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicationErrorCode {
    #[default]
    None,
    MalformedPayload,
    UnsupportedCodec,
    InvalidTransferMetadata,
    ReassemblyCreateFailed,
    ReassemblyAddFailed,
    DecodeFailed,
    ApplyFailed,
    LineageMismatch,
    BudgetLimited,
}

impl std::fmt::Display for ReplicationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
