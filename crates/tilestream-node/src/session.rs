//! Per-connection session drivers.
//!
//! [`ServerSession`] turns authoritative world state into outbound
//! envelopes each tick. [`ClientSession`] feeds inbound envelopes into a
//! local chunk store and answers with resync requests. Neither touches a
//! socket; the caller moves envelopes between them.

use std::collections::BTreeMap;

use tilestream_protocol::{
    frag_count, frag_payload_capacity, validate_server_hello, ChunkResyncRequest, ChunkSnapshotFrag, Envelope,
    FragmentPlan, Message, MessageType, ResyncReason, ServerHello, WireMessage, WorldGenConfig,
    ENVELOPE_HEADER_SIZE, FRAG_HEADER_SIZE, SNAPSHOT_CODEC_COMPRESSED,
};
use tilestream_replication::patch::{build_abs_patch, build_delta_patch};
use tilestream_replication::snapshot_codec;
use tilestream_replication::{
    ChunkStreamScheduler, Compressor, FieldMask, FragmentOutcome, PatchApplier, PatchError, PatchRect,
    ReplicationCounters, ReplicationErrorCode, SnapshotApplier, SnapshotError,
};
use tilestream_world::{ChunkIndex, ChunkStore, DirtyFlags, MemoryChunkStore, CHUNK_COUNT};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// Fragment payload size both ends agree on.
pub fn session_frag_cap() -> usize {
    frag_payload_capacity(ENVELOPE_HEADER_SIZE)
}

/// Bytes a snapshot of `packed_len` costs on the wire once fragmented.
pub fn snapshot_wire_bytes(packed_len: usize, cap: usize) -> usize {
    packed_len + frag_count(packed_len, cap) * (ENVELOPE_HEADER_SIZE + FRAG_HEADER_SIZE)
}

struct CachedSnapshot {
    snapshot_id: u32,
    packed: Vec<u8>,
}

/// Packed snapshot for `idx` at its current version, re-encoding when the
/// chunk moved on since the last send.
fn cached_snapshot<'c, S: ChunkStore + ?Sized>(
    cache: &'c mut [Option<CachedSnapshot>],
    world: &S,
    compressor: &dyn Compressor,
    idx: ChunkIndex,
) -> Option<&'c CachedSnapshot> {
    let chunk = world.chunk(idx)?;
    let snapshot_id = chunk.versions.snapshot;
    let slot = cache.get_mut(idx.as_usize())?;
    if !matches!(slot, Some(c) if c.snapshot_id == snapshot_id) {
        match snapshot_codec::encode_to_vec(chunk, snapshot_id, FieldMask::ALL, compressor) {
            Ok(packed) => *slot = Some(CachedSnapshot { snapshot_id, packed }),
            Err(e) => {
                warn!(chunk = %idx.coord(), error = %e, "snapshot encode failed");
                *slot = None;
            }
        }
    }
    slot.as_ref()
}

/// Server end of one connection.
pub struct ServerSession {
    hello: ServerHello,
    hello_sent: bool,
    scheduler: ChunkStreamScheduler,
    compressor: Box<dyn Compressor + Send>,
    frag_cap: usize,
    join_radius: i32,
    join_logged: bool,
    cache: Vec<Option<CachedSnapshot>>,
    sequence: u32,
    next_message_id: u32,
    counters: ReplicationCounters,
}

impl ServerSession {
    pub fn new(cfg: &NodeConfig) -> anyhow::Result<Self> {
        let mut world_gen = WorldGenConfig::default_for_seed(cfg.world.seed);
        world_gen.sea_level = cfg.world.sea_level;
        world_gen.validate()?;

        let mut scheduler = ChunkStreamScheduler::new(cfg.scheduler_config());
        scheduler.set_focus(cfg.stream.focus_x, cfg.stream.focus_y);

        Ok(Self {
            hello: ServerHello::new(world_gen, cfg.world.tick_rate_hz),
            hello_sent: false,
            scheduler,
            compressor: cfg.compressor()?,
            frag_cap: session_frag_cap(),
            join_radius: cfg.stream.join_radius,
            join_logged: false,
            cache: (0..CHUNK_COUNT).map(|_| None).collect(),
            sequence: 0,
            next_message_id: 0,
            counters: ReplicationCounters::default(),
        })
    }

    pub fn hello(&self) -> &ServerHello {
        &self.hello
    }

    pub fn scheduler(&self) -> &ChunkStreamScheduler {
        &self.scheduler
    }

    pub fn counters(&self) -> &ReplicationCounters {
        &self.counters
    }

    fn next_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }

    fn frame<M: WireMessage>(&mut self, msg: &M, message_id: u32) -> Envelope {
        let env = Envelope::from_message(msg, self.sequence, message_id);
        self.sequence = self.sequence.wrapping_add(1);
        env
    }

    /// Outbound traffic for one tick: the hello on first call, then as many
    /// chunk snapshots as the tick budget allows.
    pub fn tick<S: ChunkStore + ?Sized>(&mut self, world: &S, now: u64) -> Vec<Envelope> {
        let mut out = Vec::new();
        if !self.hello_sent {
            let id = self.next_message_id();
            let hello = self.hello.clone();
            out.push(self.frame(&hello, id));
            self.hello_sent = true;
            info!(
                seed = hello.world_seed,
                checksum = %hex::encode(hello.config_crc64.to_be_bytes()),
                "server hello sent"
            );
        }

        let mut budget = self.scheduler.tick_budget();
        loop {
            let Self {
                scheduler,
                cache,
                compressor,
                counters,
                frag_cap,
                ..
            } = &mut *self;
            let cap = *frag_cap;
            let picked = scheduler.next_chunk_to_send_budgeted(
                |idx| world.chunk(idx).is_some_and(|c| c.versions.snapshot > 0),
                |idx| match cached_snapshot(cache, world, &**compressor, idx) {
                    Some(c) => snapshot_wire_bytes(c.packed.len(), cap),
                    None => usize::MAX,
                },
                &mut budget,
                counters,
            );
            let Some(idx) = picked else { break };
            self.send_snapshot(idx, &mut out);
        }
        if self.scheduler.last_error_code() == ReplicationErrorCode::BudgetLimited {
            debug!(tick = now, envelopes = out.len(), "tick budget limited");
        }

        if self.scheduler.update_join_ready_fence(self.join_radius) && !self.join_logged {
            self.join_logged = true;
            info!(tick = now, radius = self.join_radius, "join fence latched");
        }
        out
    }

    fn send_snapshot(&mut self, idx: ChunkIndex, out: &mut Vec<Envelope>) {
        let message_id = self.next_message_id();
        let Some(cached) = self.cache[idx.as_usize()].as_ref() else {
            return;
        };
        let total_len = cached.packed.len();
        let plan = FragmentPlan::new(total_len, self.frag_cap);
        let count = plan.fragment_count();
        for (frag_index, offset, len) in plan {
            let frag = ChunkSnapshotFrag {
                coord: idx.coord(),
                snapshot_id: cached.snapshot_id,
                total_len: total_len as u32,
                frag_index: frag_index as u16,
                frag_count: count as u16,
                codec: SNAPSHOT_CODEC_COMPRESSED,
                payload: cached.packed[offset..offset + len].to_vec(),
            };
            out.push(Envelope::from_message(&frag, self.sequence, message_id));
            self.sequence = self.sequence.wrapping_add(1);
        }
        debug!(
            chunk = %idx.coord(),
            snapshot = cached.snapshot_id,
            bytes = total_len,
            fragments = count,
            "snapshot queued"
        );
        self.scheduler.mark_have(idx);
    }

    /// Handle one inbound envelope from the client.
    pub fn on_envelope(&mut self, env: &Envelope) {
        match env.message() {
            Ok(Message::ChunkResyncRequest(req)) => self.on_resync(&req),
            Ok(other) => warn!(message_type = ?other.message_type(), "unexpected message from client"),
            Err(e) => warn!(error = %e, "malformed client message"),
        }
    }

    /// Forget that the client holds the chunk and send it ahead of the
    /// ring scan.
    pub fn on_resync(&mut self, req: &ChunkResyncRequest) {
        let Some(idx) = req.coord.index() else {
            warn!(chunk = %req.coord, "resync for chunk outside the grid");
            return;
        };
        self.scheduler.clear_have(idx);
        self.scheduler.enqueue_resync(idx);
        debug!(
            chunk = %req.coord,
            reason = ?req.reason,
            client_snapshot = req.client_snapshot_id,
            "resync queued"
        );
    }

    /// Rewrite heights inside `rect` of the authoritative chunk and advance
    /// its lineage. Returns the patch to send when the client is believed
    /// to hold the chunk; otherwise the next snapshot carries the edit.
    pub fn edit_heights<S: ChunkStore + ?Sized>(
        &mut self,
        world: &mut S,
        idx: ChunkIndex,
        rect: PatchRect,
        mut edit: impl FnMut(u8) -> u8,
    ) -> anyhow::Result<Option<Envelope>> {
        if !rect.fits_chunk() {
            anyhow::bail!("edit rect {rect:?} outside chunk");
        }
        let chunk = world
            .chunk_mut(idx)
            .ok_or_else(|| anyhow::anyhow!("chunk {idx} outside the world"))?;
        let before = chunk.clone();
        let base = chunk.versions.snapshot;
        let new = base
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("snapshot lineage exhausted for chunk {idx}"))?;

        for tile in rect.tiles() {
            chunk.height[tile] = edit(chunk.height[tile]);
        }
        chunk.versions.snapshot = new;
        chunk.versions.height = new;
        chunk.dirty |= DirtyFlags::HEIGHT | DirtyFlags::SNAPSHOT;
        chunk.dirty_rect.mark_rect(rect.rx, rect.ry, rect.rw, rect.rh);

        if !self.scheduler.has_chunk(idx) {
            return Ok(None);
        }
        let patch = match build_delta_patch(&before, chunk, idx.coord(), base, new, rect) {
            Ok(p) => p,
            Err(PatchError::DeltaOutOfRange { .. }) => build_abs_patch(chunk, idx.coord(), base, new, rect)?,
            Err(e) => return Err(e.into()),
        };
        let id = self.next_message_id();
        Ok(Some(self.frame(&patch, id)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Wanted {
    reason: ResyncReason,
    expected_base: u32,
    last_sent: Option<u64>,
}

/// Client end of one connection, owning its chunk cache.
pub struct ClientSession {
    store: MemoryChunkStore,
    hello: Option<ServerHello>,
    snapshots: SnapshotApplier,
    patches: PatchApplier,
    counters: ReplicationCounters,
    retry_after: u64,
    wanted: BTreeMap<ChunkIndex, Wanted>,
    focus: (i32, i32),
    watch_radius: i32,
    join_radius: i32,
    grace_ticks: u64,
    joined_at: Option<u64>,
    join_ready: bool,
    sequence: u32,
    next_message_id: u32,
}

impl ClientSession {
    pub fn new(cfg: &NodeConfig) -> anyhow::Result<Self> {
        let repl = cfg.replication_config();
        let snapshots = SnapshotApplier::new(cfg.compressor()?, session_frag_cap(), repl.transfer_timeout_ticks);
        let grace_ticks = snapshots.reassembly().timeout_ticks();
        Ok(Self {
            store: MemoryChunkStore::new(cfg.world.sea_level),
            hello: None,
            snapshots,
            patches: PatchApplier::new(&repl),
            counters: ReplicationCounters::default(),
            retry_after: repl.resync_cooldown_ticks.max(1),
            wanted: BTreeMap::new(),
            focus: (cfg.stream.focus_x, cfg.stream.focus_y),
            watch_radius: cfg.stream.ring_radius,
            join_radius: cfg.stream.join_radius,
            grace_ticks,
            joined_at: None,
            join_ready: false,
            sequence: 0,
            next_message_id: 0,
        })
    }

    pub fn store(&self) -> &MemoryChunkStore {
        &self.store
    }

    pub fn hello(&self) -> Option<&ServerHello> {
        self.hello.as_ref()
    }

    pub fn counters(&self) -> &ReplicationCounters {
        &self.counters
    }

    pub fn snapshots(&self) -> &SnapshotApplier {
        &self.snapshots
    }

    /// Chunks waiting on a resync snapshot.
    pub fn wanted_chunks(&self) -> usize {
        self.wanted.len()
    }

    pub fn is_join_ready(&self) -> bool {
        self.join_ready
    }

    fn frame(&mut self, req: &ChunkResyncRequest) -> Envelope {
        let env = Envelope::from_message(req, self.sequence, self.next_message_id);
        self.sequence = self.sequence.wrapping_add(1);
        self.next_message_id = self.next_message_id.wrapping_add(1);
        env
    }

    /// Handle one inbound envelope; returns any replies.
    pub fn on_envelope(&mut self, env: &Envelope, now: u64) -> Vec<Envelope> {
        let mut out = Vec::new();
        match env.header.message_type {
            MessageType::ServerHello => self.on_hello(&env.payload, now),
            ty if self.hello.is_none() => debug!(message_type = ?ty, "dropping message before hello"),
            MessageType::ChunkSnapshotFrag => self.on_fragment(&env.payload, now),
            MessageType::ChunkPatchRect => {
                if let Some(req) = self.on_patch(&env.payload, now) {
                    out.push(self.frame(&req));
                }
            }
            ty => warn!(message_type = ?ty, "unexpected message from server"),
        }
        out
    }

    fn on_hello(&mut self, payload: &[u8], now: u64) {
        let hello = match validate_server_hello(payload) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "server hello rejected");
                return;
            }
        };
        if let Some(current) = &self.hello {
            if current.config_crc64 == hello.config_crc64 {
                debug!("duplicate server hello ignored");
                return;
            }
            warn!("server world changed, dropping local cache");
        }
        info!(
            seed = hello.world_seed,
            sea_level = hello.sea_level,
            tick_rate = hello.tick_rate_hz,
            "joined server world"
        );
        self.store = MemoryChunkStore::new(hello.sea_level);
        self.wanted.clear();
        self.join_ready = false;
        self.joined_at = Some(now);
        self.hello = Some(hello);
    }

    fn on_fragment(&mut self, payload: &[u8], now: u64) {
        match self.snapshots.on_fragment(&mut self.store, &mut self.counters, payload, now) {
            Ok(FragmentOutcome::Applied { chunk, snapshot_id }) => {
                self.wanted.remove(&chunk);
                debug!(chunk = %chunk.coord(), snapshot = snapshot_id, "chunk snapshot committed");
            }
            Ok(FragmentOutcome::Pending) => {}
            Err(SnapshotError::Decode { chunk, .. }) => {
                self.want(chunk, ResyncReason::SnapshotDecodeFailed, 0);
            }
            Err(SnapshotError::StaleSnapshot { .. }) => {}
            Err(e) => debug!(error = %e, "fragment dropped"),
        }
    }

    fn on_patch(&mut self, payload: &[u8], now: u64) -> Option<ChunkResyncRequest> {
        match self.patches.apply(&mut self.store, &mut self.counters, payload, now) {
            Ok(_) => None,
            Err(PatchError::LineageMismatch {
                coord,
                expected_base,
                resync,
                ..
            }) => {
                if let Some(idx) = coord.index() {
                    self.want(idx, ResyncReason::PatchBaseMismatch, expected_base);
                    if resync.is_some() {
                        if let Some(w) = self.wanted.get_mut(&idx) {
                            w.last_sent = Some(now);
                        }
                    }
                }
                resync
            }
            Err(e) => {
                warn!(error = %e, "patch rejected");
                None
            }
        }
    }

    fn want(&mut self, idx: ChunkIndex, reason: ResyncReason, expected_base: u32) {
        self.wanted.entry(idx).or_insert(Wanted {
            reason,
            expected_base,
            last_sent: None,
        });
    }

    /// Chunks in view that never arrived and have nothing in flight.
    fn flag_missing(&mut self) {
        let (fx, fy) = self.focus;
        for idx in ChunkIndex::square(fx, fy, self.watch_radius) {
            let missing = self.store.chunk(idx).is_some_and(|c| c.versions.snapshot == 0);
            if missing && !self.snapshots.reassembly().contains_chunk(idx) {
                self.want(idx, ResyncReason::TransferTimedOut, 0);
            }
        }
    }

    /// Per-tick housekeeping: evict stalled transfers, chase missing
    /// chunks, and re-request outstanding resyncs. Retries share the patch
    /// applier's throttle with lineage-mismatch requests.
    pub fn tick(&mut self, now: u64) -> Vec<Envelope> {
        let mut out = Vec::new();
        let evicted = self.snapshots.evict_expired_transfers(&mut self.counters, now);
        if evicted > 0 {
            debug!(evicted, "stalled snapshot transfers dropped");
        }
        let Some(joined_at) = self.joined_at else {
            return out;
        };
        if now.saturating_sub(joined_at) >= self.grace_ticks {
            self.flag_missing();
        }

        let retry_after = self.retry_after;
        let due: Vec<ChunkIndex> = self
            .wanted
            .iter()
            .filter(|(_, w)| w.last_sent.map_or(true, |t| now.saturating_sub(t) >= retry_after))
            .map(|(idx, _)| *idx)
            .collect();
        for idx in due {
            let client_snapshot_id = self.store.chunk(idx).map_or(0, |c| c.versions.snapshot);
            let Some(w) = self.wanted.get_mut(&idx) else {
                continue;
            };
            let req = ChunkResyncRequest {
                coord: idx.coord(),
                expected_base_snapshot_id: w.expected_base,
                client_snapshot_id,
                reason: w.reason,
            };
            let Some(req) = self.patches.throttle_resync(&mut self.counters, req, now) else {
                continue;
            };
            w.last_sent = Some(now);
            out.push(self.frame(&req));
        }

        if !self.join_ready {
            let (fx, fy) = self.focus;
            self.join_ready = ChunkIndex::square(fx, fy, self.join_radius)
                .all(|idx| self.store.chunk(idx).is_some_and(|c| c.versions.snapshot > 0));
            if self.join_ready {
                info!(tick = now, radius = self.join_radius, "client join-ready");
            }
        }
        out
    }
}
