use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;
use smallvec::SmallVec;

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::types::{ContractViolation, TileId};

/// Lifecycle state of one tile. The discriminants are the encoding exposed on the debug
/// `tile_state` port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum TileState {
    #[default]
    Idle = 0,
    Loading = 1,
    Ready = 2,
    InUse = 3,
    Evicting = 4,
}

impl TileState {
    /// Decode a raw encoding. Anything undefined resolves to `Idle`.
    pub fn from_encoding(raw: u8) -> Self {
        Self::from_u8(raw).unwrap_or(TileState::Idle)
    }

    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Consumer reads may reach the arbiter.
    pub fn is_visible(self) -> bool {
        matches!(self, TileState::Ready | TileState::InUse)
    }
}

impl Display for TileState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TileState::Idle => "idle",
            TileState::Loading => "loading",
            TileState::Ready => "ready",
            TileState::InUse => "in_use",
            TileState::Evicting => "evicting",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tile {
    pub state: TileState,
    /// only meaningful while Ready
    pub first_read_seen: bool,
}

/// Everything that can happen to one tile in one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileTriggers {
    pub load: bool,
    pub store: bool,
    pub fence: bool,
    pub dma_write_done: bool,
    pub dma_read_done: bool,
    /// a permitted consumer read targeted the tile
    pub read_seen: bool,
}

/// Illegal command observed by [`transition`]; the command has no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalCommand {
    Load,
    Store,
}

/// Next-state function. A `tile_store` arriving in the same cycle as the first read of a
/// Ready tile wins: the tile goes to Evicting and the read is served against the old state.
pub fn transition(tile: Tile, t: TileTriggers) -> (Tile, SmallVec<[IllegalCommand; 2]>) {
    let mut illegal = SmallVec::new();
    if t.load && tile.state != TileState::Idle {
        illegal.push(IllegalCommand::Load);
    }
    if t.store && tile.state != TileState::Ready {
        illegal.push(IllegalCommand::Store);
    }

    let next = match tile.state {
        TileState::Idle if t.load => Tile {
            state: TileState::Loading,
            first_read_seen: false,
        },
        TileState::Loading if t.dma_write_done => Tile {
            state: TileState::Ready,
            first_read_seen: false,
        },
        TileState::Ready if t.store => Tile {
            state: TileState::Evicting,
            first_read_seen: false,
        },
        TileState::Ready if t.read_seen && !tile.first_read_seen => Tile {
            state: TileState::InUse,
            first_read_seen: true,
        },
        TileState::InUse if t.fence => Tile {
            state: TileState::Ready,
            first_read_seen: false,
        },
        TileState::Evicting if t.dma_read_done => Tile {
            state: TileState::Idle,
            first_read_seen: false,
        },
        _ => tile,
    };
    (next, illegal)
}

/// Control-side inputs for one cycle: pulsed commands plus DMA completion pulses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileCommands {
    pub load: Option<TileId>,
    pub store: Option<TileId>,
    pub fence: Option<TileId>,
    /// applies to every tile currently Loading
    pub dma_write_done: bool,
    /// applies to every tile currently Evicting
    pub dma_read_done: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TileStepResult {
    pub fence_done: bool,
    pub violations: Vec<ContractViolation>,
}

#[derive(Debug, Default)]
pub struct TileFsmState {
    tiles: Vec<Tile>,
}

/// Owns every tile's lifecycle state. Nothing else mutates tile state.
pub struct TileStateMachine {
    base: ModuleBase<TileFsmState, TileBufferConfig>,
}

module!(TileStateMachine, TileFsmState, TileBufferConfig,);

impl ModuleBehaviors for TileStateMachine {
    fn tick_one(&mut self) {
        self.base.cycle += 1;
    }

    fn reset(&mut self) {
        self.base.state.tiles.fill(Tile::default());
    }
}

impl TileStateMachine {
    pub fn new(config: Arc<TileBufferConfig>) -> Self {
        let mut me = TileStateMachine {
            base: ModuleBase::with_state(TileFsmState {
                tiles: vec![Tile::default(); config.num_tiles],
            }),
        };
        me.init_conf(config);
        me
    }

    pub fn num_tiles(&self) -> usize {
        self.base.state.tiles.len()
    }

    pub fn tile(&self, tile: TileId) -> Option<Tile> {
        self.base.state.tiles.get(tile).copied()
    }

    pub fn state(&self, tile: TileId) -> Option<TileState> {
        self.tile(tile).map(|t| t.state)
    }

    pub fn states(&self) -> Vec<TileState> {
        self.base.state.tiles.iter().map(|t| t.state).collect()
    }

    pub fn read_permitted(&self, tile: TileId) -> bool {
        self.state(tile).is_some_and(TileState::is_visible)
    }

    pub fn dma_write_permitted(&self, tile: TileId) -> bool {
        self.state(tile) == Some(TileState::Idle)
    }

    pub fn dma_read_permitted(&self, tile: TileId) -> bool {
        self.state(tile) == Some(TileState::Ready)
    }

    /// Bank activity hint: some tile is in flight.
    pub fn any_active(&self) -> bool {
        self.base
            .state
            .tiles
            .iter()
            .any(|t| t.state != TileState::Idle)
    }

    /// Overwrite a tile's state from a raw encoding, as a debug register write would.
    pub fn load_encoding(&mut self, tile: TileId, raw: u8) {
        if let Some(t) = self.base.state.tiles.get_mut(tile) {
            *t = Tile {
                state: TileState::from_encoding(raw),
                first_read_seen: false,
            };
        }
    }

    /// Advance every tile by one cycle. `reads_seen[tile]` is set when a permitted consumer
    /// read targeted that tile this cycle. `tile_fence_done` reflects the state before the edge.
    pub fn step(&mut self, cmds: &TileCommands, reads_seen: &[bool]) -> TileStepResult {
        let mut result = TileStepResult::default();
        let num_tiles = self.num_tiles();

        for id in [cmds.load, cmds.store, cmds.fence].into_iter().flatten() {
            if id >= num_tiles {
                result
                    .violations
                    .push(ContractViolation::UnknownTile { tile: id });
            }
        }
        result.fence_done = cmds
            .fence
            .is_some_and(|id| self.state(id) == Some(TileState::Ready));

        for (id, tile) in self.base.state.tiles.iter_mut().enumerate() {
            let triggers = TileTriggers {
                load: cmds.load == Some(id),
                store: cmds.store == Some(id),
                fence: cmds.fence == Some(id),
                dma_write_done: cmds.dma_write_done,
                dma_read_done: cmds.dma_read_done,
                read_seen: reads_seen.get(id).copied().unwrap_or(false),
            };
            let (next, illegal) = transition(*tile, triggers);
            for cmd in illegal {
                result.violations.push(match cmd {
                    IllegalCommand::Load => ContractViolation::IllegalLoad {
                        tile: id,
                        state: tile.state,
                    },
                    IllegalCommand::Store => ContractViolation::IllegalStore {
                        tile: id,
                        state: tile.state,
                    },
                });
            }
            if next.state != tile.state {
                debug!("tile {}: {} -> {}", id, tile.state, next.state);
            }
            *tile = next;
        }
        result
    }
}
