//! World-generation configuration blob.
//!
//! The server ships this blob in its hello so clients can confirm they
//! interpret chunk data with identical generation parameters. The layout is
//! fixed-size little-endian and reserved bytes round-trip untouched, so a
//! checksum over the re-serialized blob equals the one over the received
//! bytes.

use bytes::{Buf, BufMut};

use crate::crc64::crc64;
use crate::{ensure_len, WireError};

pub const WORLD_GEN_BLOB_SIZE: usize = 56;

pub const WORLD_GEN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldGenConfig {
    pub world_gen_version: u32,
    pub world_seed: u64,

    pub sea_level: u8,
    pub height_curve: u8,
    pub base_amplitude: u8,
    pub reserved0: u8,

    pub base_grid_tiles: u16,
    pub octave_grid_tiles: [u16; 3],
    /// Octave weights in Q16 fixed point.
    pub octave_weights_q16: [u16; 4],

    pub warp_grid_tiles: u16,
    pub warp_strength_q8: u16,

    pub river_count: u16,
    pub river_max_steps: u16,
    pub river_min_source_above_sea: u8,
    pub river_stamp_width: u8,
    pub reserved1: u16,

    pub enable_biomes: u8,
    pub latitude_bands: u8,
    pub altitude_bands: u8,
    pub reserved2: u8,

    /// Max height delta per slope class 1..=3.
    pub slope_class_max_delta: [u8; 3],
    pub reserved3: u8,

    pub max_rail_slope_class_for_stations: u8,
    pub max_rail_slope_class_for_track: u8,
    pub allow_terraform_on_rivers: u8,
    pub reserved4: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorldGenConfigError {
    #[error("unsupported world gen version {0}")]
    UnsupportedVersion(u32),
    #[error("sea level {0} out of range")]
    SeaLevelOutOfRange(u8),
    #[error("grid sizes must be non-zero")]
    InvalidGridSizes,
    #[error("octave weights are all zero")]
    InvalidWeights,
    #[error("river count and max steps must be non-zero")]
    InvalidRiverSettings,
    #[error("slope thresholds must be non-decreasing")]
    InvalidSlopeThresholds,
    #[error("station slope class exceeds track slope class")]
    InvalidRailSlopeRules,
    #[error("biome bands must be non-zero when biomes are enabled")]
    InvalidBiomeBands,
}

impl WorldGenConfig {
    pub fn default_for_seed(world_seed: u64) -> Self {
        Self {
            world_gen_version: WORLD_GEN_VERSION,
            world_seed,
            sea_level: 96,
            height_curve: 1,
            base_amplitude: 255,
            reserved0: 0,
            base_grid_tiles: 256,
            octave_grid_tiles: [128, 64, 32],
            octave_weights_q16: [29491, 16384, 11796, 7864],
            warp_grid_tiles: 0,
            warp_strength_q8: 0,
            river_count: 64,
            river_max_steps: 4096,
            river_min_source_above_sea: 48,
            river_stamp_width: 1,
            reserved1: 0,
            enable_biomes: 1,
            latitude_bands: 8,
            altitude_bands: 8,
            reserved2: 0,
            slope_class_max_delta: [1, 3, 6],
            reserved3: 0,
            max_rail_slope_class_for_stations: 1,
            max_rail_slope_class_for_track: 2,
            allow_terraform_on_rivers: 0,
            reserved4: 0,
        }
    }

    pub fn to_blob(&self) -> [u8; WORLD_GEN_BLOB_SIZE] {
        let mut blob = [0u8; WORLD_GEN_BLOB_SIZE];
        let mut out = &mut blob[..];
        out.put_u32_le(self.world_gen_version);
        out.put_u64_le(self.world_seed);
        out.put_u8(self.sea_level);
        out.put_u8(self.height_curve);
        out.put_u8(self.base_amplitude);
        out.put_u8(self.reserved0);
        out.put_u16_le(self.base_grid_tiles);
        for g in self.octave_grid_tiles {
            out.put_u16_le(g);
        }
        for w in self.octave_weights_q16 {
            out.put_u16_le(w);
        }
        out.put_u16_le(self.warp_grid_tiles);
        out.put_u16_le(self.warp_strength_q8);
        out.put_u16_le(self.river_count);
        out.put_u16_le(self.river_max_steps);
        out.put_u8(self.river_min_source_above_sea);
        out.put_u8(self.river_stamp_width);
        out.put_u16_le(self.reserved1);
        out.put_u8(self.enable_biomes);
        out.put_u8(self.latitude_bands);
        out.put_u8(self.altitude_bands);
        out.put_u8(self.reserved2);
        out.put_slice(&self.slope_class_max_delta);
        out.put_u8(self.reserved3);
        out.put_u8(self.max_rail_slope_class_for_stations);
        out.put_u8(self.max_rail_slope_class_for_track);
        out.put_u8(self.allow_terraform_on_rivers);
        out.put_u8(self.reserved4);
        blob
    }

    pub fn from_blob(src: &[u8]) -> Result<Self, WireError> {
        ensure_len(src, WORLD_GEN_BLOB_SIZE)?;
        let mut buf = &src[..WORLD_GEN_BLOB_SIZE];
        Ok(Self {
            world_gen_version: buf.get_u32_le(),
            world_seed: buf.get_u64_le(),
            sea_level: buf.get_u8(),
            height_curve: buf.get_u8(),
            base_amplitude: buf.get_u8(),
            reserved0: buf.get_u8(),
            base_grid_tiles: buf.get_u16_le(),
            octave_grid_tiles: [buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le()],
            octave_weights_q16: [buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le()],
            warp_grid_tiles: buf.get_u16_le(),
            warp_strength_q8: buf.get_u16_le(),
            river_count: buf.get_u16_le(),
            river_max_steps: buf.get_u16_le(),
            river_min_source_above_sea: buf.get_u8(),
            river_stamp_width: buf.get_u8(),
            reserved1: buf.get_u16_le(),
            enable_biomes: buf.get_u8(),
            latitude_bands: buf.get_u8(),
            altitude_bands: buf.get_u8(),
            reserved2: buf.get_u8(),
            slope_class_max_delta: [buf.get_u8(), buf.get_u8(), buf.get_u8()],
            reserved3: buf.get_u8(),
            max_rail_slope_class_for_stations: buf.get_u8(),
            max_rail_slope_class_for_track: buf.get_u8(),
            allow_terraform_on_rivers: buf.get_u8(),
            reserved4: buf.get_u8(),
        })
    }

    pub fn checksum(&self) -> u64 {
        crc64(&self.to_blob())
    }

    pub fn validate(&self) -> Result<(), WorldGenConfigError> {
        if self.world_gen_version != WORLD_GEN_VERSION {
            return Err(WorldGenConfigError::UnsupportedVersion(self.world_gen_version));
        }
        // Sea must leave room for both water and land.
        if self.sea_level == 0 || self.sea_level == u8::MAX {
            return Err(WorldGenConfigError::SeaLevelOutOfRange(self.sea_level));
        }
        if self.base_grid_tiles == 0 || self.octave_grid_tiles.contains(&0) {
            return Err(WorldGenConfigError::InvalidGridSizes);
        }
        if self.octave_weights_q16.iter().all(|&w| w == 0) {
            return Err(WorldGenConfigError::InvalidWeights);
        }
        if self.river_count == 0 || self.river_max_steps == 0 {
            return Err(WorldGenConfigError::InvalidRiverSettings);
        }
        let [c1, c2, c3] = self.slope_class_max_delta;
        if !(c1 <= c2 && c2 <= c3) {
            return Err(WorldGenConfigError::InvalidSlopeThresholds);
        }
        if self.max_rail_slope_class_for_stations > self.max_rail_slope_class_for_track {
            return Err(WorldGenConfigError::InvalidRailSlopeRules);
        }
        if self.enable_biomes != 0 && (self.latitude_bands == 0 || self.altitude_bands == 0) {
            return Err(WorldGenConfigError::InvalidBiomeBands);
        }
        Ok(())
    }
}
