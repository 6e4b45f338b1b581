//! In-process loopback: one authoritative world, one server session, one
//! client session, and a lossy link between them.
//!
//! [`Loopback`] steps both ends in lockstep and is deterministic for a
//! given config. [`run_loopback`] runs the same pieces as two tokio tasks
//! joined by channels, ticking on wall-clock intervals.

use std::time::Duration;

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use tilestream_protocol::{Envelope, EnvelopeCodec, Lane};
use tilestream_replication::{PatchRect, ReplicationCounters};
use tilestream_world::{Chunk, ChunkIndex, ChunkStore, MemoryChunkStore, CHUNK_SIZE};

use crate::config::NodeConfig;
use crate::session::{ClientSession, ServerSession};

const DOWNLINK_CAPACITY: usize = 4096;
const UPLINK_CAPACITY: usize = 1024;

/// Deterministic terrain: per-chunk base height with a row gradient, a few
/// river columns, and latitude biome bands. Every chunk starts at
/// snapshot 1.
pub fn seed_world(seed: u64, sea_level: u8) -> MemoryChunkStore {
    let mut rng = StdRng::seed_from_u64(seed);
    MemoryChunkStore::from_fn(sea_level, |idx, chunk| {
        let base: u8 = rng.gen_range(40..=200);
        let step: u8 = rng.gen_range(0..=3);
        let flat = rng.gen_bool(0.2);
        for ly in 0..CHUNK_SIZE {
            let h = if flat { base } else { base.saturating_add(step * (ly / 8) as u8) };
            for lx in 0..CHUNK_SIZE {
                chunk.height[Chunk::tile_index(lx, ly)] = h;
            }
        }
        if !flat && rng.gen_bool(0.25) {
            let col = rng.gen_range(0..CHUNK_SIZE);
            for ly in 0..CHUNK_SIZE {
                chunk.river_mask[Chunk::tile_index(col, ly)] = 1;
            }
        }
        chunk.biome.fill(idx.coord().y as u8 / 8 + 1);
        chunk.versions.snapshot = 1;
        chunk.versions.height = 1;
    })
}

/// Round-trips envelopes through the wire codec and drops a share of the
/// unreliable-lane ones. Reliable lanes always arrive.
pub struct LossyLink {
    rng: StdRng,
    loss_percent: u8,
    codec: EnvelopeCodec,
    buf: BytesMut,
    dropped: u64,
    delivered: u64,
}

impl LossyLink {
    pub fn new(loss_percent: u8, rng_seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(rng_seed),
            loss_percent: loss_percent.min(100),
            codec: EnvelopeCodec::default(),
            buf: BytesMut::with_capacity(2048),
            dropped: 0,
            delivered: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn transmit(&mut self, envelopes: Vec<Envelope>) -> anyhow::Result<Vec<Envelope>> {
        let mut out = Vec::with_capacity(envelopes.len());
        for env in envelopes {
            if env.header.lane == Lane::UnreliableSequenced && self.rng.gen_range(0..100u8) < self.loss_percent {
                self.dropped += 1;
                continue;
            }
            self.codec.encode(env, &mut self.buf)?;
            let decoded = self
                .codec
                .decode(&mut self.buf)?
                .ok_or_else(|| anyhow::anyhow!("link codec returned a partial frame"))?;
            self.delivered += 1;
            out.push(decoded);
        }
        Ok(out)
    }
}

/// Random height edits near the focus on a fixed cadence.
pub struct Editor {
    rng: StdRng,
    interval: u64,
    until: u64,
    focus: (i32, i32),
    radius: i32,
    edits: u64,
}

impl Editor {
    pub fn new(cfg: &NodeConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(cfg.link.rng_seed.wrapping_add(cfg.world.seed)),
            interval: cfg.sim.edit_interval_ticks,
            until: cfg.sim.edit_until_tick,
            focus: (cfg.stream.focus_x, cfg.stream.focus_y),
            radius: cfg.stream.ring_radius.max(0),
            edits: 0,
        }
    }

    pub fn edits(&self) -> u64 {
        self.edits
    }

    /// Edit one chunk when `now` falls on the cadence. Deltas reach past
    /// the i8 range so some edits travel as absolute patches.
    pub fn maybe_edit(
        &mut self,
        world: &mut MemoryChunkStore,
        server: &mut ServerSession,
        now: u64,
    ) -> anyhow::Result<Option<Envelope>> {
        if self.interval == 0 || now >= self.until || now % self.interval != 0 {
            return Ok(None);
        }
        let cells: Vec<ChunkIndex> = ChunkIndex::square(self.focus.0, self.focus.1, self.radius).collect();
        let Some(&idx) = cells.choose(&mut self.rng) else {
            return Ok(None);
        };
        let rw = self.rng.gen_range(1..=8u8);
        let rh = self.rng.gen_range(1..=8u8);
        let rx = self.rng.gen_range(0..=CHUNK_SIZE as u8 - rw);
        let ry = self.rng.gen_range(0..=CHUNK_SIZE as u8 - rh);
        let delta: i16 = self.rng.gen_range(-160..=160);
        self.edits += 1;
        server.edit_heights(world, idx, PatchRect::new(rx, ry, rw, rh), |h| {
            (h as i16 + delta).clamp(0, u8::MAX as i16) as u8
        })
    }
}

/// Everything the server end owns.
pub struct ServerSide {
    pub world: MemoryChunkStore,
    pub session: ServerSession,
    pub editor: Editor,
    pub link: LossyLink,
}

impl ServerSide {
    pub fn new(cfg: &NodeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            world: seed_world(cfg.world.seed, cfg.world.sea_level),
            session: ServerSession::new(cfg)?,
            editor: Editor::new(cfg),
            link: LossyLink::new(cfg.link.loss_percent, cfg.link.rng_seed),
        })
    }

    /// Consume client traffic, edit, and emit this tick's downlink after
    /// the link has had its way with it.
    pub fn step(&mut self, inbound: impl IntoIterator<Item = Envelope>, now: u64) -> anyhow::Result<Vec<Envelope>> {
        for env in inbound {
            self.session.on_envelope(&env);
        }
        let mut out = self.session.tick(&self.world, now);
        if let Some(patch) = self.editor.maybe_edit(&mut self.world, &mut self.session, now)? {
            out.push(patch);
        }
        self.link.transmit(out)
    }
}

/// Everything the client end owns.
pub struct ClientSide {
    pub session: ClientSession,
    pub link: LossyLink,
}

impl ClientSide {
    pub fn new(cfg: &NodeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            session: ClientSession::new(cfg)?,
            link: LossyLink::new(cfg.link.loss_percent, cfg.link.rng_seed.wrapping_add(1)),
        })
    }

    pub fn step(&mut self, inbound: impl IntoIterator<Item = Envelope>, now: u64) -> anyhow::Result<Vec<Envelope>> {
        let mut out = Vec::new();
        for env in inbound {
            out.extend(self.session.on_envelope(&env, now));
        }
        out.extend(self.session.tick(now));
        self.link.transmit(out)
    }
}

/// Outcome of a loopback run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub ticks: u64,
    pub loss_percent: u8,
    pub edits: u64,
    pub server: ReplicationCounters,
    pub client: ReplicationCounters,
    /// Both ends summed.
    pub total: ReplicationCounters,
    pub chunks_in_view: usize,
    pub diverging_in_view: usize,
    pub wanted_chunks: usize,
    pub link_dropped: u64,
    pub link_delivered: u64,
    pub join_ready: bool,
}

/// Chunks around `focus` whose client copy differs from the world.
pub fn diverging_in_view(world: &MemoryChunkStore, client: &MemoryChunkStore, focus: (i32, i32), radius: i32) -> usize {
    ChunkIndex::square(focus.0, focus.1, radius)
        .filter(|&idx| match (world.chunk(idx), client.chunk(idx)) {
            (Some(a), Some(b)) => !a.same_fields(b),
            _ => true,
        })
        .count()
}

fn report(cfg: &NodeConfig, ticks: u64, server: &ServerSide, client: &ClientSide) -> SimReport {
    let focus = (cfg.stream.focus_x, cfg.stream.focus_y);
    let radius = cfg.stream.ring_radius;
    let mut total = *server.session.counters();
    total.merge(client.session.counters());
    SimReport {
        ticks,
        loss_percent: cfg.link.loss_percent,
        edits: server.editor.edits(),
        server: *server.session.counters(),
        client: *client.session.counters(),
        total,
        chunks_in_view: ChunkIndex::square(focus.0, focus.1, radius).count(),
        diverging_in_view: diverging_in_view(&server.world, client.session.store(), focus, radius),
        wanted_chunks: client.session.wanted_chunks(),
        link_dropped: server.link.dropped() + client.link.dropped(),
        link_delivered: server.link.delivered() + client.link.delivered(),
        join_ready: client.session.is_join_ready(),
    }
}

/// Lockstep loopback. Downlink traffic of tick `t` reaches the client in
/// tick `t`; replies reach the server at the start of tick `t + 1`.
pub struct Loopback {
    cfg: NodeConfig,
    server: ServerSide,
    client: ClientSide,
    uplink: Vec<Envelope>,
    now: u64,
}

impl Loopback {
    pub fn new(cfg: NodeConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        Ok(Self {
            server: ServerSide::new(&cfg)?,
            client: ClientSide::new(&cfg)?,
            cfg,
            uplink: Vec::new(),
            now: 0,
        })
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn server(&self) -> &ServerSide {
        &self.server
    }

    pub fn client(&self) -> &ClientSide {
        &self.client
    }

    pub fn step(&mut self) -> anyhow::Result<()> {
        self.now += 1;
        let inbound = std::mem::take(&mut self.uplink);
        let down = self.server.step(inbound, self.now)?;
        self.uplink = self.client.step(down, self.now)?;
        Ok(())
    }

    pub fn run(&mut self, ticks: u64) -> anyhow::Result<()> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    pub fn diverging_in_view(&self) -> usize {
        diverging_in_view(
            &self.server.world,
            self.client.session.store(),
            (self.cfg.stream.focus_x, self.cfg.stream.focus_y),
            self.cfg.stream.ring_radius,
        )
    }

    pub fn report(&self) -> SimReport {
        report(&self.cfg, self.now, &self.server, &self.client)
    }
}

fn tick_period(cfg: &NodeConfig) -> Duration {
    Duration::from_secs_f64(1.0 / cfg.world.tick_rate_hz.max(1) as f64)
}

async fn run_server(
    mut side: ServerSide,
    ticks: u64,
    period: Duration,
    mut up_rx: mpsc::Receiver<Envelope>,
    down_tx: mpsc::Sender<Envelope>,
    shutdown_tx: broadcast::Sender<()>,
) -> anyhow::Result<ServerSide> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for now in 1..=ticks {
        interval.tick().await;
        let mut inbound = Vec::new();
        while let Ok(env) = up_rx.try_recv() {
            inbound.push(env);
        }
        for env in side.step(inbound, now)? {
            if down_tx.send(env).await.is_err() {
                warn!("client task gone, stopping server");
                let _ = shutdown_tx.send(());
                return Ok(side);
            }
        }
    }

    info!(ticks, "server finished");
    let _ = shutdown_tx.send(());
    Ok(side)
}

async fn run_client(
    mut side: ClientSide,
    period: Duration,
    mut down_rx: mpsc::Receiver<Envelope>,
    up_tx: mpsc::Sender<Envelope>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<ClientSide> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut now = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                now += 1;
                let mut inbound = Vec::new();
                while let Ok(env) = down_rx.try_recv() {
                    inbound.push(env);
                }
                for env in side.step(inbound, now)? {
                    if let Err(e) = up_tx.try_send(env) {
                        debug!(error = %e, "uplink full, request dropped");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(ticks = now, "client shutting down");
                return Ok(side);
            }
        }
    }
}

/// Run server and client as separate tasks for `cfg.sim.ticks` server
/// ticks at `cfg.world.tick_rate_hz`.
pub async fn run_loopback(cfg: NodeConfig) -> anyhow::Result<SimReport> {
    cfg.validate()?;
    let server = ServerSide::new(&cfg)?;
    let client = ClientSide::new(&cfg)?;
    let period = tick_period(&cfg);
    let ticks = cfg.sim.ticks;

    let (down_tx, down_rx) = mpsc::channel::<Envelope>(DOWNLINK_CAPACITY);
    let (up_tx, up_rx) = mpsc::channel::<Envelope>(UPLINK_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    info!(
        ticks,
        tick_rate = cfg.world.tick_rate_hz,
        loss = cfg.link.loss_percent,
        radius = cfg.stream.ring_radius,
        "starting loopback"
    );

    let client_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(run_client(client, period, down_rx, up_tx, shutdown))
    };
    let server_handle = tokio::spawn(run_server(server, ticks, period, up_rx, down_tx, shutdown_tx));

    let server = server_handle.await??;
    let client = client_handle.await??;
    let report = report(&cfg, ticks, &server, &client);
    info!(
        diverging = report.diverging_in_view,
        in_view = report.chunks_in_view,
        dropped = report.link_dropped,
        "loopback finished"
    );
    Ok(report)
}
