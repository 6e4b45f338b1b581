//! Test harness for in-process tilestream-node integration tests.
//!
//! Provides TestConfigBuilder for small, fast loopback configs and helpers
//! for moving envelopes between sessions by hand.

use tilestream_node::config::NodeConfig;
use tilestream_node::session::ClientSession;
use tilestream_protocol::{ChunkSnapshotFrag, Envelope, MessageType, WireMessage};
use tilestream_world::ChunkCoord;

/// Read TEST_LOSS_PERCENT from environment, falling back to `default`.
pub fn test_loss_percent(default: u8) -> u8 {
    std::env::var("TEST_LOSS_PERCENT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Builder over [`NodeConfig`] with short timeouts so loss recovery fits
/// in a few hundred ticks.
pub struct TestConfigBuilder {
    cfg: NodeConfig,
}

#[allow(dead_code)]
impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut cfg = NodeConfig::default();
        cfg.stream.ring_radius = 2;
        cfg.stream.focus_x = 10;
        cfg.stream.focus_y = 10;
        cfg.reassembly.timeout_ticks = 20;
        cfg.resync.cooldown_ticks = 10;
        cfg.resync.window_ticks = 10;
        cfg.resync.max_per_window = 8;
        cfg.sim.ticks = 300;
        cfg.sim.edit_interval_ticks = 3;
        cfg.sim.edit_until_tick = 120;
        Self { cfg }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.cfg.world.seed = seed;
        self.cfg.link.rng_seed = seed.wrapping_mul(31).wrapping_add(7);
        self
    }

    pub fn loss(mut self, percent: u8) -> Self {
        self.cfg.link.loss_percent = percent;
        self
    }

    pub fn radius(mut self, radius: i32) -> Self {
        self.cfg.stream.ring_radius = radius;
        self
    }

    pub fn focus(mut self, x: i32, y: i32) -> Self {
        self.cfg.stream.focus_x = x;
        self.cfg.stream.focus_y = y;
        self
    }

    pub fn ticks(mut self, ticks: u64) -> Self {
        self.cfg.sim.ticks = ticks;
        self
    }

    pub fn edits(mut self, interval: u64, until: u64) -> Self {
        self.cfg.sim.edit_interval_ticks = interval;
        self.cfg.sim.edit_until_tick = until;
        self
    }

    pub fn no_edits(mut self) -> Self {
        self.cfg.sim.edit_interval_ticks = 0;
        self
    }

    pub fn budget(mut self, bytes: usize, messages: usize) -> Self {
        self.cfg.stream.max_bytes_per_tick = bytes;
        self.cfg.stream.max_messages_per_tick = messages;
        self
    }

    pub fn tick_rate(mut self, hz: u32) -> Self {
        self.cfg.world.tick_rate_hz = hz;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.cfg
    }
}

/// Coordinate a snapshot fragment envelope belongs to, if it is one.
pub fn fragment_coord(env: &Envelope) -> Option<ChunkCoord> {
    if env.header.message_type != MessageType::ChunkSnapshotFrag {
        return None;
    }
    ChunkSnapshotFrag::decode(&env.payload).ok().map(|f| f.coord)
}

/// Hand every envelope to the client, collecting its replies.
pub fn deliver(client: &mut ClientSession, envs: &[Envelope], now: u64) -> Vec<Envelope> {
    envs.iter().flat_map(|e| client.on_envelope(e, now)).collect()
}
