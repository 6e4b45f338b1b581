//! Per-connection chunk streaming scheduler.
//!
//! Decides which chunk snapshot to send next. Resync requests go first in
//! arrival order; after that, chunks the client does not yet have are
//! picked ring by ring outward from the client's focus chunk. Every pick is
//! charged against a per-tick byte and message budget.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tilestream_protocol::CURRENT_ERA;
use tilestream_world::{clip_span, ChunkIndex, CHUNKS_H, CHUNKS_W, CHUNK_COUNT};
use tracing::debug;

use crate::counters::ReplicationCounters;
use crate::ReplicationErrorCode;

const HAVE_WORDS: usize = CHUNK_COUNT.div_ceil(64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Chebyshev radius scanned around the focus chunk.
    pub ring_radius: i32,
    pub max_bytes_per_tick: usize,
    pub max_messages_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ring_radius: CURRENT_ERA.ring_radius,
            max_bytes_per_tick: CURRENT_ERA.max_bytes_per_tick,
            max_messages_per_tick: CURRENT_ERA.max_messages_per_tick,
        }
    }
}

/// What is left to spend this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBudget {
    pub remaining_bytes: usize,
    pub remaining_messages: usize,
}

impl TickBudget {
    pub fn new(remaining_bytes: usize, remaining_messages: usize) -> Self {
        Self {
            remaining_bytes,
            remaining_messages,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_messages == 0
    }

    fn try_spend(&mut self, bytes: usize) -> bool {
        if bytes > self.remaining_bytes {
            return false;
        }
        self.remaining_bytes -= bytes;
        self.remaining_messages -= 1;
        true
    }
}

/// Fixed 1024-bit presence set indexed by chunk index.
#[derive(Debug, Clone, Default)]
struct HaveSet([u64; HAVE_WORDS]);

impl HaveSet {
    fn get(&self, index: ChunkIndex) -> bool {
        let i = index.as_usize();
        self.0[i >> 6] & (1u64 << (i & 63)) != 0
    }

    fn set(&mut self, index: ChunkIndex) {
        let i = index.as_usize();
        self.0[i >> 6] |= 1u64 << (i & 63);
    }

    fn clear(&mut self, index: ChunkIndex) {
        let i = index.as_usize();
        self.0[i >> 6] &= !(1u64 << (i & 63));
    }

    fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

pub struct ChunkStreamScheduler {
    config: SchedulerConfig,
    have: HaveSet,
    high: VecDeque<ChunkIndex>,
    focus: (i32, i32),
    join_ready: bool,
    last_error: ReplicationErrorCode,
}

impl ChunkStreamScheduler {
    /// Zero budgets fall back to the era defaults.
    pub fn new(mut config: SchedulerConfig) -> Self {
        let defaults = SchedulerConfig::default();
        if config.max_bytes_per_tick == 0 {
            config.max_bytes_per_tick = defaults.max_bytes_per_tick;
        }
        if config.max_messages_per_tick == 0 {
            config.max_messages_per_tick = defaults.max_messages_per_tick;
        }
        Self {
            config,
            have: HaveSet::default(),
            high: VecDeque::with_capacity(64),
            focus: (0, 0),
            join_ready: false,
            last_error: ReplicationErrorCode::None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// `BudgetLimited` when the last budgeted pick skipped or stopped on
    /// the tick budget.
    pub fn last_error_code(&self) -> ReplicationErrorCode {
        self.last_error
    }

    /// A full budget for one tick.
    pub fn tick_budget(&self) -> TickBudget {
        TickBudget::new(self.config.max_bytes_per_tick, self.config.max_messages_per_tick)
    }

    pub fn set_focus(&mut self, cx: i32, cy: i32) {
        self.focus = (cx, cy);
    }

    pub fn focus(&self) -> (i32, i32) {
        self.focus
    }

    pub fn has_chunk(&self, index: ChunkIndex) -> bool {
        self.have.get(index)
    }

    pub fn mark_have(&mut self, index: ChunkIndex) {
        self.have.set(index);
    }

    pub fn clear_have(&mut self, index: ChunkIndex) {
        self.have.clear(index);
    }

    pub fn have_count(&self) -> usize {
        self.have.count()
    }

    pub fn enqueue_resync(&mut self, index: ChunkIndex) {
        self.high.push_back(index);
    }

    pub fn pending_resyncs(&self) -> usize {
        self.high.len()
    }

    /// True when every chunk within `radius` of the focus, clipped to the
    /// grid, is marked present.
    pub fn is_ready_around_focus(&self, radius: i32) -> bool {
        let (fx, fy) = self.focus;
        ChunkIndex::square(fx, fy, radius).all(|idx| self.have.get(idx))
    }

    /// Next chunk with no budget limits.
    pub fn next_chunk_to_send(&mut self, is_ready: impl FnMut(ChunkIndex) -> bool) -> Option<ChunkIndex> {
        let mut budget = TickBudget::unlimited();
        let mut scratch = ReplicationCounters::default();
        self.next_chunk_to_send_budgeted(is_ready, |_| 0, &mut budget, &mut scratch)
    }

    /// Next chunk to send, charged against `budget`.
    ///
    /// Queued resyncs are popped first: unready entries are discarded and
    /// entries too large for the remaining bytes are dropped and counted.
    /// Neither is re-queued; a later lineage mismatch asks again. Then the
    /// rings around focus are scanned from distance 0 outward, skipping
    /// chunks the client already has.
    pub fn next_chunk_to_send_budgeted(
        &mut self,
        mut is_ready: impl FnMut(ChunkIndex) -> bool,
        mut estimate: impl FnMut(ChunkIndex) -> usize,
        budget: &mut TickBudget,
        counters: &mut ReplicationCounters,
    ) -> Option<ChunkIndex> {
        if budget.is_exhausted() {
            self.last_error = ReplicationErrorCode::BudgetLimited;
            return None;
        }
        self.last_error = ReplicationErrorCode::None;

        while let Some(idx) = self.high.pop_front() {
            if !is_ready(idx) {
                continue;
            }
            let bytes = estimate(idx);
            if budget.try_spend(bytes) {
                return Some(idx);
            }
            counters.scheduler_budget_drops += 1;
            self.last_error = ReplicationErrorCode::BudgetLimited;
            debug!(chunk = %idx.coord(), bytes, remaining = budget.remaining_bytes, "resync dropped over budget");
        }

        let (fx, fy) = self.focus;
        for r in 0..=self.config.ring_radius {
            for idx in ring(fx, fy, r) {
                if self.have.get(idx) || !is_ready(idx) {
                    continue;
                }
                let bytes = estimate(idx);
                if budget.try_spend(bytes) {
                    return Some(idx);
                }
                counters.scheduler_budget_drops += 1;
                self.last_error = ReplicationErrorCode::BudgetLimited;
            }
        }
        None
    }

    /// Latch the join fence once the focus neighbourhood is complete.
    /// Stays latched until [`reset_join_ready_fence`](Self::reset_join_ready_fence).
    pub fn update_join_ready_fence(&mut self, required_radius: i32) -> bool {
        if !self.join_ready {
            self.join_ready = self.is_ready_around_focus(required_radius);
        }
        self.join_ready
    }

    pub fn reset_join_ready_fence(&mut self) {
        self.join_ready = false;
    }

    pub fn is_join_ready(&self) -> bool {
        self.join_ready
    }
}

/// Chunks at Chebyshev distance exactly `r` from `(fx, fy)`, clipped to the
/// grid, in row-major order.
fn ring(fx: i32, fy: i32, r: i32) -> impl Iterator<Item = ChunkIndex> {
    let (min_x, max_x) = clip_span(fx, r, CHUNKS_W);
    let (min_y, max_y) = clip_span(fy, r, CHUNKS_H);
    (min_y..=max_y)
        .flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
        .filter(move |&(x, y)| (x - fx).abs().max((y - fy).abs()) == r)
        .filter_map(|(x, y)| ChunkIndex::new(x as usize + y as usize * CHUNKS_W).ok())
}
