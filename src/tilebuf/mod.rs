pub mod arbiter;
pub mod bank;
pub mod config;
pub mod decoder;
pub mod dma;
pub mod power;
pub mod stats;
pub mod subsystem;
pub mod tile;
pub mod types;

#[cfg(test)]
mod unit_tests;

pub use config::{PowerConfig, TileBufferConfig};
pub use subsystem::{CycleInputs, CycleOutputs, TileBuffer};
pub use types::{Access, Addr, Word};
