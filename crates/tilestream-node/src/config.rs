//! Configuration types for tilestream-node.
//! Parsed from ~/.tilestream/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tilestream_protocol::CURRENT_ERA;
use tilestream_replication::{compressor_by_name, Compressor, ReplicationConfig, SchedulerConfig};
use tilestream_world::DEFAULT_SEA_LEVEL;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub world: WorldSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub reassembly: ReassemblySection,
    #[serde(default)]
    pub resync: ResyncSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub sim: SimSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSection {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_sea_level")]
    pub sea_level: u8,
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            sea_level: default_sea_level(),
            tick_rate_hz: default_tick_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_ring_radius")]
    pub ring_radius: i32,
    #[serde(default = "default_bytes_per_tick")]
    pub max_bytes_per_tick: usize,
    #[serde(default = "default_messages_per_tick")]
    pub max_messages_per_tick: usize,
    #[serde(default = "default_1")]
    pub join_radius: i32,
    #[serde(default = "default_focus")]
    pub focus_x: i32,
    #[serde(default = "default_focus")]
    pub focus_y: i32,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            ring_radius: default_ring_radius(),
            max_bytes_per_tick: default_bytes_per_tick(),
            max_messages_per_tick: default_messages_per_tick(),
            join_radius: 1,
            focus_x: default_focus(),
            focus_y: default_focus(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassemblySection {
    #[serde(default = "default_transfer_timeout")]
    pub timeout_ticks: u64,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        Self {
            timeout_ticks: default_transfer_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncSection {
    #[serde(default = "default_resync_cooldown")]
    pub cooldown_ticks: u64,
    #[serde(default = "default_resync_window")]
    pub window_ticks: u64,
    #[serde(default = "default_resync_max")]
    pub max_per_window: usize,
}

impl Default for ResyncSection {
    fn default() -> Self {
        Self {
            cooldown_ticks: default_resync_cooldown(),
            window_ticks: default_resync_window(),
            max_per_window: default_resync_max(),
        }
    }
}

/// In-process link between the simulated server and client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSection {
    /// Percentage of unreliable-lane datagrams dropped, 0..=100.
    #[serde(default)]
    pub loss_percent: u8,
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
    #[serde(default = "default_compressor")]
    pub compressor: String,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            loss_percent: 0,
            rng_seed: default_rng_seed(),
            compressor: default_compressor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSection {
    #[serde(default = "default_ticks")]
    pub ticks: u64,
    /// Server edits one chunk every this many ticks. 0 disables edits.
    #[serde(default = "default_edit_interval")]
    pub edit_interval_ticks: u64,
    /// No edits at or after this tick.
    #[serde(default = "default_edit_until")]
    pub edit_until_tick: u64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            ticks: default_ticks(),
            edit_interval_ticks: default_edit_interval(),
            edit_until_tick: default_edit_until(),
        }
    }
}

// Default value functions
fn default_seed() -> u64 {
    1
}
fn default_sea_level() -> u8 {
    DEFAULT_SEA_LEVEL
}
fn default_tick_rate() -> u32 {
    CURRENT_ERA.tick_rate_hz
}
fn default_ring_radius() -> i32 {
    CURRENT_ERA.ring_radius
}
fn default_bytes_per_tick() -> usize {
    CURRENT_ERA.max_bytes_per_tick
}
fn default_messages_per_tick() -> usize {
    CURRENT_ERA.max_messages_per_tick
}
fn default_1() -> i32 {
    1
}
fn default_focus() -> i32 {
    16
}
fn default_transfer_timeout() -> u64 {
    CURRENT_ERA.transfer_timeout_ticks
}
fn default_resync_cooldown() -> u64 {
    CURRENT_ERA.resync_cooldown_ticks
}
fn default_resync_window() -> u64 {
    CURRENT_ERA.resync_window_ticks
}
fn default_resync_max() -> usize {
    CURRENT_ERA.resync_max_per_window
}
fn default_rng_seed() -> u64 {
    7
}
fn default_compressor() -> String {
    "rle".into()
}
fn default_ticks() -> u64 {
    600
}
fn default_edit_interval() -> u64 {
    5
}
fn default_edit_until() -> u64 {
    300
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.link.loss_percent > 100 {
            anyhow::bail!("link.loss_percent must be 0..=100, got {}", self.link.loss_percent);
        }
        if self.world.tick_rate_hz == 0 {
            anyhow::bail!("world.tick_rate_hz must be positive");
        }
        if self.stream.ring_radius < 0 || self.stream.join_radius < 0 {
            anyhow::bail!("stream radii must not be negative");
        }
        if self.world.sea_level == 0 || self.world.sea_level == u8::MAX {
            anyhow::bail!("world.sea_level must be 1..=254, got {}", self.world.sea_level);
        }
        self.compressor()?;
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            transfer_timeout_ticks: self.reassembly.timeout_ticks,
            resync_cooldown_ticks: self.resync.cooldown_ticks,
            resync_window_ticks: self.resync.window_ticks,
            resync_max_per_window: self.resync.max_per_window,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            ring_radius: self.stream.ring_radius,
            max_bytes_per_tick: self.stream.max_bytes_per_tick,
            max_messages_per_tick: self.stream.max_messages_per_tick,
        }
    }

    pub fn compressor(&self) -> anyhow::Result<Box<dyn Compressor + Send>> {
        compressor_by_name(&self.link.compressor)
            .ok_or_else(|| anyhow::anyhow!("unknown compressor {:?}", self.link.compressor))
    }
}
