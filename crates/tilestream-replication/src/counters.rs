//! Monotonic replication tallies for telemetry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationCounters {
    pub fragments_received: u64,
    pub reassembly_failures: u64,
    pub timeout_evictions: u64,
    pub snapshots_applied: u64,
    pub patch_applies: u64,
    pub patch_mismatches: u64,
    pub resync_issued: u64,
    pub resync_suppressed: u64,
    pub scheduler_budget_drops: u64,
}

impl ReplicationCounters {
    /// Add every tally of `other` into `self`.
    pub fn merge(&mut self, other: &ReplicationCounters) {
        self.fragments_received += other.fragments_received;
        self.reassembly_failures += other.reassembly_failures;
        self.timeout_evictions += other.timeout_evictions;
        self.snapshots_applied += other.snapshots_applied;
        self.patch_applies += other.patch_applies;
        self.patch_mismatches += other.patch_mismatches;
        self.resync_issued += other.resync_issued;
        self.resync_suppressed += other.resync_suppressed;
        self.scheduler_budget_drops += other.scheduler_budget_drops;
    }
}
