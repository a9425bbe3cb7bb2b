use serde::Deserialize;

use crate::sim::config::Config;
use crate::tilebuf::types::{Addr, TileId};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub enabled: bool,
    /// a requester starts the next pattern only once every requester finished the current one
    pub lockstep_patterns: bool,
    pub reqs_per_pattern: u32,
    /// tiles DMA-loaded before traffic starts, fenced and stored back afterwards
    pub tiles: Vec<TileId>,
    /// external address of tile 0's backing data; tile `t` lives at `ext_base + t * ext_stride`
    pub ext_base: Addr,
    pub ext_stride: Addr,
    /// external address the tiles are stored back to
    pub store_base: Addr,
    pub logging: TrafficLoggingConfig,
    pub patterns: Vec<TrafficPatternSpec>,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lockstep_patterns: true,
            reqs_per_pattern: 64,
            tiles: vec![0],
            ext_base: 0x10_0000,
            ext_stride: 0x1000,
            store_base: 0x20_0000,
            logging: TrafficLoggingConfig::default(),
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficLoggingConfig {
    pub print_traffic_lines: bool,
}

impl Default for TrafficLoggingConfig {
    fn default() -> Self {
        Self {
            print_traffic_lines: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficPatternSpec {
    pub name: String,
    /// strided | same_bank | random
    pub kind: String,
    /// read | write
    pub op: String,
    /// tile whose address range the pattern walks
    pub tile: TileId,
    /// strided: words between consecutive requests of one requester
    pub req_stride: u32,
    /// strided: words between requesters
    pub requester_stride: u32,
    /// same_bank: the bank every request lands on
    pub bank: usize,
    /// random: word offsets drawn from `[random_min, random_max)`; 0 max means the whole tile
    pub random_min: u32,
    pub random_max: u32,
    pub seed: u64,
}

impl Default for TrafficPatternSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            op: "read".to_string(),
            tile: 0,
            req_stride: 1,
            requester_stride: 1,
            bank: 0,
            random_min: 0,
            random_max: 0,
            seed: 0,
        }
    }
}
