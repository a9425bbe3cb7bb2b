use anyhow::ensure;
use serde::Deserialize;

use crate::sim::config::Config;
use crate::tilebuf::types::{Addr, RequesterId};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TileBufferConfig {
    pub num_banks: usize,
    /// words per bank
    pub bank_depth: usize,
    pub num_requesters: usize,
    /// requesters per stall group (a warp)
    pub requesters_per_group: usize,
    pub num_tiles: usize,
    /// reset value of the region base register
    pub region_base: Addr,
    /// reset value of the region limit register
    pub region_limit: Addr,
    pub panic_on_violation: bool,
    pub power: PowerConfig,
}

impl Config for TileBufferConfig {}

impl Default for TileBufferConfig {
    fn default() -> Self {
        Self {
            num_banks: 8,
            bank_depth: 256,
            num_requesters: 8,
            requesters_per_group: 4,
            num_tiles: 4,
            region_base: 0x00,
            region_limit: 0x7F,
            panic_on_violation: false,
            power: PowerConfig::default(),
        }
    }
}

impl TileBufferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.num_banks > 0 && self.num_banks.is_power_of_two(),
            "num_banks must be a non-zero power of two, got {}",
            self.num_banks
        );
        ensure!(self.bank_depth > 0, "bank_depth must be > 0");
        ensure!(self.num_requesters > 0, "num_requesters must be > 0");
        ensure!(self.requesters_per_group > 0, "requesters_per_group must be > 0");
        ensure!(self.num_tiles > 0, "num_tiles must be > 0");
        ensure!(
            self.power.idle_cycles > 0 && self.power.sleep_cycles > 0,
            "power idle_cycles and sleep_cycles must be > 0"
        );
        Ok(())
    }

    pub fn bank_bits(&self) -> u32 {
        self.num_banks.trailing_zeros()
    }

    pub fn capacity_words(&self) -> u64 {
        (self.num_banks * self.bank_depth) as u64
    }

    pub fn num_groups(&self) -> usize {
        self.num_requesters.div_ceil(self.requesters_per_group)
    }

    pub fn group_of(&self, requester: RequesterId) -> usize {
        requester / self.requesters_per_group
    }

    /// Arbiter slots: every consumer plus the DMA port.
    pub fn arbiter_slots(&self) -> usize {
        self.num_requesters + 1
    }

    /// The DMA port arbitrates in the last slot and belongs to no stall group.
    pub fn dma_slot(&self) -> RequesterId {
        self.num_requesters
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct PowerConfig {
    /// when false, every bank is held active
    pub enabled: bool,
    pub idle_cycles: u64,
    pub sleep_cycles: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_cycles: 16,
            sleep_cycles: 64,
        }
    }
}
