use std::fmt::{Display, Formatter};

use crate::tilebuf::tile::TileState;

pub type Word = u64;
pub type Addr = u64;
pub type BankId = usize;
pub type RequesterId = usize;
pub type TileId = usize;

/// One consumer's access for one cycle. A requester presents at most one access per cycle, so a
/// simultaneous read and write from the same requester cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { addr: Addr },
    Write { addr: Addr, data: Word },
}

impl Access {
    pub fn addr(&self) -> Addr {
        match *self {
            Access::Read { addr } | Access::Write { addr, .. } => addr,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Access::Write { .. })
    }
}

/// An operation the arbiter hands to one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankOp {
    Read { offset: usize },
    Write { offset: usize, data: Word },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    /// consumer read to a tile that is neither Ready nor InUse
    ReadNotVisible { requester: RequesterId, tile: TileId, state: TileState },
    DmaWriteNotIdle { tile: TileId, state: TileState },
    DmaReadNotReady { tile: TileId, state: TileState },
    IllegalLoad { tile: TileId, state: TileState },
    IllegalStore { tile: TileId, state: TileState },
    UnknownTile { tile: TileId },
    DmaOutOfRegion { addr: Addr },
}

impl ContractViolation {
    pub fn kind(&self) -> &'static str {
        match self {
            ContractViolation::ReadNotVisible { .. } => "read_not_visible",
            ContractViolation::DmaWriteNotIdle { .. } => "dma_write_not_idle",
            ContractViolation::DmaReadNotReady { .. } => "dma_read_not_ready",
            ContractViolation::IllegalLoad { .. } => "illegal_load",
            ContractViolation::IllegalStore { .. } => "illegal_store",
            ContractViolation::UnknownTile { .. } => "unknown_tile",
            ContractViolation::DmaOutOfRegion { .. } => "dma_out_of_region",
        }
    }
}

impl Display for ContractViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractViolation::ReadNotVisible { requester, tile, state } => write!(
                f,
                "requester {} read tile {} while {}",
                requester, tile, state
            ),
            ContractViolation::DmaWriteNotIdle { tile, state } => {
                write!(f, "dma write into tile {} while {}", tile, state)
            }
            ContractViolation::DmaReadNotReady { tile, state } => {
                write!(f, "dma read out of tile {} while {}", tile, state)
            }
            ContractViolation::IllegalLoad { tile, state } => {
                write!(f, "tile_load({}) while {}", tile, state)
            }
            ContractViolation::IllegalStore { tile, state } => {
                write!(f, "tile_store({}) while {}", tile, state)
            }
            ContractViolation::UnknownTile { tile } => write!(f, "no such tile {}", tile),
            ContractViolation::DmaOutOfRegion { addr } => {
                write!(f, "dma access to non-resident address {:#x}", addr)
            }
        }
    }
}
