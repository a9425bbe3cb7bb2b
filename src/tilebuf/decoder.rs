use log::{info, warn};

use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::types::{Addr, BankId, TileId};

/// Inclusive `[base, limit]` window of scratchpad-resident addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    pub base: Addr,
    pub limit: Addr,
}

impl RegionConfig {
    pub fn new(base: Addr, limit: Addr) -> Self {
        Self { base, limit }
    }

    /// Number of words in the region, or `None` when `base > limit`.
    pub fn size_words(&self) -> Option<u64> {
        if self.base > self.limit {
            return None;
        }
        (self.limit - self.base).checked_add(1)
    }
}

/// Decoder classification of one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Resident { bank: BankId, offset: usize, tile: TileId },
    /// above `limit`, or anything at all when the region is malformed
    External,
    /// below `base`
    Below,
}

impl Decoded {
    pub fn is_resident(&self) -> bool {
        matches!(self, Decoded::Resident { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Decoded::External)
    }
}

/// Combinational address decoder. Bank selection takes the low `log2(num_banks)` bits of the
/// offset within the region; the remaining bits index into the bank.
#[derive(Debug, Clone)]
pub struct AddressDecoder {
    bank_bits: u32,
    bank_mask: u64,
    capacity: u64,
    num_tiles: usize,
}

impl AddressDecoder {
    pub fn new(config: &TileBufferConfig) -> Self {
        Self {
            bank_bits: config.bank_bits(),
            bank_mask: (config.num_banks as u64) - 1,
            capacity: config.capacity_words(),
            num_tiles: config.num_tiles,
        }
    }

    /// A region is usable when `base <= limit` and it fits in the banks; anything else is
    /// treated as all-external.
    pub fn region_is_usable(&self, region: &RegionConfig) -> bool {
        region
            .size_words()
            .is_some_and(|size| size <= self.capacity)
    }

    pub fn decode(&self, addr: Addr, region: &RegionConfig) -> Decoded {
        if !self.region_is_usable(region) {
            return Decoded::External;
        }
        if addr > region.limit {
            return Decoded::External;
        }
        if addr < region.base {
            return Decoded::Below;
        }
        let rel = addr - region.base;
        Decoded::Resident {
            bank: (rel & self.bank_mask) as BankId,
            offset: (rel >> self.bank_bits) as usize,
            tile: self.tile_of_offset(rel, region),
        }
    }

    /// Words per tile: the region split evenly, the last tile absorbing any remainder.
    pub fn tile_words(&self, region: &RegionConfig) -> u64 {
        region
            .size_words()
            .map(|size| (size / self.num_tiles as u64).max(1))
            .unwrap_or(1)
    }

    /// First and last resident address of a tile, if the tile exists in the region.
    pub fn tile_range(&self, tile: TileId, region: &RegionConfig) -> Option<(Addr, Addr)> {
        if tile >= self.num_tiles || !self.region_is_usable(region) {
            return None;
        }
        let words = self.tile_words(region);
        let first = region.base.checked_add(tile as u64 * words)?;
        if first > region.limit {
            return None;
        }
        let last = if tile + 1 == self.num_tiles {
            region.limit
        } else {
            (first + words - 1).min(region.limit)
        };
        Some((first, last))
    }

    /// Whether any word of `tile` is stored in `bank`.
    pub fn tile_covers_bank(&self, tile: TileId, bank: BankId, region: &RegionConfig) -> bool {
        let Some((first, last)) = self.tile_range(tile, region) else {
            return false;
        };
        if last - first >= self.bank_mask {
            return true;
        }
        (first..=last).any(|addr| ((addr - region.base) & self.bank_mask) as BankId == bank)
    }

    fn tile_of_offset(&self, rel: u64, region: &RegionConfig) -> TileId {
        let tile = rel / self.tile_words(region);
        (tile as usize).min(self.num_tiles - 1)
    }
}

/// The `(base, limit)` configuration register pair. Writes land in a shadow copy and become
/// visible on the following cycle.
#[derive(Debug, Clone)]
pub struct RegionRegister {
    reset_value: RegionConfig,
    current: RegionConfig,
    pending: Option<RegionConfig>,
}

impl RegionRegister {
    pub fn new(config: &TileBufferConfig) -> Self {
        let reset_value = RegionConfig::new(config.region_base, config.region_limit);
        Self {
            reset_value,
            current: reset_value,
            pending: None,
        }
    }

    pub fn current(&self) -> RegionConfig {
        self.current
    }

    pub fn write(&mut self, region: RegionConfig) {
        self.pending = Some(region);
    }

    /// Apply the pending write, if any. Returns true when the register changed.
    pub fn commit(&mut self, decoder: &AddressDecoder) -> bool {
        let Some(next) = self.pending.take() else {
            return false;
        };
        if !decoder.region_is_usable(&next) {
            warn!(
                "region [{:#x}, {:#x}] is malformed or exceeds bank capacity; all addresses decode external",
                next.base, next.limit
            );
        }
        info!("region register <- [{:#x}, {:#x}]", next.base, next.limit);
        let changed = next != self.current;
        self.current = next;
        changed
    }

    pub fn reset(&mut self) {
        self.current = self.reset_value;
        self.pending = None;
    }
}
