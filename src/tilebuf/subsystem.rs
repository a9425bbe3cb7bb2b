use std::sync::Arc;

use log::{debug, warn};

use crate::base::behavior::ModuleBehaviors;
use crate::base::mem::ExternalMemory;
use crate::tilebuf::arbiter::{ArbiterOutcome, BankArbiter, RequestMatrix};
use crate::tilebuf::bank::{BankArray, BankResult};
use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::decoder::{AddressDecoder, Decoded, RegionConfig, RegionRegister};
use crate::tilebuf::power::{PowerControls, PowerManager, PowerState};
use crate::tilebuf::stats::TileBufferStats;
use crate::tilebuf::tile::{TileCommands, TileState, TileStateMachine};
use crate::tilebuf::types::{
    Access, Addr, BankId, BankOp, ContractViolation, RequesterId, TileId, Word,
};
use crate::timeq::Cycle;

/// Everything presented to the tile buffer in one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleInputs {
    /// indexed by requester; missing entries are idle
    pub consumers: Vec<Option<Access>>,
    pub dma: Option<Access>,
    pub commands: TileCommands,
    /// takes effect on the next cycle
    pub config_write: Option<RegionConfig>,
    pub power: PowerControls,
    /// a DMA job is moving data
    pub dma_active: bool,
}

impl CycleInputs {
    pub fn idle(num_requesters: usize) -> Self {
        Self {
            consumers: vec![None; num_requesters],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerResponse {
    pub read_ready: bool,
    pub read_data: Word,
    pub write_ready: bool,
    pub bank_conflict: bool,
    pub must_stall: bool,
    /// the access went to the external tier
    pub external: bool,
}

impl ConsumerResponse {
    pub fn ready(&self) -> bool {
        self.read_ready || self.write_ready
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaResponse {
    pub read_ready: bool,
    pub read_data: Word,
    pub write_ready: bool,
    /// refused by the visibility contract; will never succeed in the tile's current state
    pub rejected: bool,
    pub bank_conflict: bool,
}

impl DmaResponse {
    pub fn ready(&self) -> bool {
        self.read_ready || self.write_ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankStatus {
    pub active: bool,
    pub power_state: PowerState,
    pub needs_reload: bool,
}

/// A resident access that passed the visibility gate and reached the arbiter, with the tile
/// state it was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitrated {
    pub bank: BankId,
    pub tile: TileId,
    pub tile_state: TileState,
    pub is_write: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOutputs {
    pub cycle: Cycle,
    pub consumers: Vec<ConsumerResponse>,
    pub group_stall: Vec<bool>,
    pub dma: DmaResponse,
    pub tile_fence_done: bool,
    /// after this cycle's edge
    pub tile_states: Vec<TileState>,
    /// after this cycle's edge
    pub banks: Vec<BankStatus>,
    /// indexed by arbiter slot (consumers, then DMA)
    pub arbitrated: Vec<Option<Arbitrated>>,
    pub arbitration: ArbiterOutcome,
    pub violations: Vec<ContractViolation>,
}

/// The tile buffer: decoder, banks, arbiter, tile state machine and power manager wired
/// together, advanced one clock edge per [`TileBuffer::step`].
pub struct TileBuffer {
    config: Arc<TileBufferConfig>,
    decoder: AddressDecoder,
    region: RegionRegister,
    banks: BankArray,
    arbiter: BankArbiter,
    tiles: TileStateMachine,
    power: PowerManager,
    stats: TileBufferStats,
    cycle: Cycle,
}

impl ModuleBehaviors for TileBuffer {
    fn tick_one(&mut self) {
        self.banks.tick_one();
        self.arbiter.tick_one();
        self.tiles.tick_one();
        self.power.tick_one();
        self.cycle += 1;
    }

    fn reset(&mut self) {
        self.region.reset();
        self.banks.reset();
        self.arbiter.reset();
        self.tiles.reset();
        self.power.reset();
    }
}

impl TileBuffer {
    pub fn new(config: Arc<TileBufferConfig>) -> anyhow::Result<Self> {
        config.validate()?;
        let decoder = AddressDecoder::new(&config);
        let region = RegionRegister::new(&config);
        if !decoder.region_is_usable(&region.current()) {
            warn!(
                "reset region [{:#x}, {:#x}] is unusable; all addresses decode external",
                config.region_base, config.region_limit
            );
        }
        Ok(Self {
            decoder,
            region,
            banks: BankArray::new(Arc::clone(&config)),
            arbiter: BankArbiter::new(Arc::clone(&config)),
            tiles: TileStateMachine::new(Arc::clone(&config)),
            power: PowerManager::new(Arc::clone(&config)),
            stats: TileBufferStats::new(config.num_requesters, config.num_banks),
            cycle: 0,
            config,
        })
    }

    pub fn config(&self) -> &TileBufferConfig {
        &self.config
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn stats(&self) -> &TileBufferStats {
        &self.stats
    }

    pub fn region(&self) -> RegionConfig {
        self.region.current()
    }

    pub fn decode(&self, addr: Addr) -> Decoded {
        self.decoder.decode(addr, &self.region.current())
    }

    pub fn tile_state(&self, tile: TileId) -> Option<TileState> {
        self.tiles.state(tile)
    }

    pub fn tile_states(&self) -> Vec<TileState> {
        self.tiles.states()
    }

    pub fn tile_range(&self, tile: TileId) -> Option<(Addr, Addr)> {
        self.decoder.tile_range(tile, &self.region.current())
    }

    pub fn tile_covers_bank(&self, tile: TileId, bank: BankId) -> bool {
        self.decoder
            .tile_covers_bank(tile, bank, &self.region.current())
    }

    pub fn arbiter(&self) -> &BankArbiter {
        &self.arbiter
    }

    pub fn power(&self) -> &PowerManager {
        &self.power
    }

    pub fn tiles_mut(&mut self) -> &mut TileStateMachine {
        &mut self.tiles
    }

    /// Backdoor read of a resident word, ignoring power and tile state.
    pub fn peek(&self, addr: Addr) -> Option<Word> {
        match self.decode(addr) {
            Decoded::Resident { bank, offset, .. } => self.banks.bank(bank)?.peek(offset),
            _ => None,
        }
    }

    /// Backdoor write of a resident word, ignoring power and tile state.
    pub fn poke(&mut self, addr: Addr, data: Word) -> bool {
        match self.decode(addr) {
            Decoded::Resident { bank, offset, .. } => self
                .banks
                .bank_mut(bank)
                .is_some_and(|store| store.poke(offset, data)),
            _ => false,
        }
    }

    pub fn step(&mut self, inputs: &CycleInputs, ext: &mut dyn ExternalMemory) -> CycleOutputs {
        let now = self.cycle;
        let region = self.region.current();
        let num_requesters = self.config.num_requesters;
        let num_banks = self.config.num_banks;
        let dma_slot = self.config.dma_slot();
        let slots = self.config.arbiter_slots();

        let mut out = CycleOutputs {
            cycle: now,
            consumers: vec![ConsumerResponse::default(); num_requesters],
            arbitrated: vec![None; slots],
            ..CycleOutputs::default()
        };
        let mut matrix = RequestMatrix::new(slots, num_banks);
        let mut ops: Vec<Option<BankOp>> = vec![None; slots];
        let mut reads_seen = vec![false; self.tiles.num_tiles()];
        let mut activity = vec![false; num_banks];
        let mut violations = Vec::new();

        for requester in 0..num_requesters {
            let Some(access) = inputs.consumers.get(requester).copied().flatten() else {
                self.stats.record_idle(requester);
                continue;
            };
            let rstats = &mut self.stats.requesters[requester];
            if access.is_write() {
                rstats.writes += 1;
            } else {
                rstats.reads += 1;
            }

            match self.decoder.decode(access.addr(), &region) {
                Decoded::Resident { bank, offset, tile } => {
                    let tile_state = self.tiles.state(tile).unwrap_or_default();
                    if !access.is_write() {
                        if !tile_state.is_visible() {
                            out.consumers[requester].must_stall = true;
                            self.stats.requesters[requester].must_stalls += 1;
                            self.stats.record_idle(requester);
                            violations.push(ContractViolation::ReadNotVisible {
                                requester,
                                tile,
                                state: tile_state,
                            });
                            continue;
                        }
                        reads_seen[tile] = true;
                    }
                    matrix.set(requester, bank, access.is_write());
                    ops[requester] = Some(bank_op(access, offset));
                    out.arbitrated[requester] = Some(Arbitrated {
                        bank,
                        tile,
                        tile_state,
                        is_write: access.is_write(),
                    });
                    activity[bank] = true;
                }
                Decoded::External | Decoded::Below => {
                    self.stats.record_idle(requester);
                    let resp = &mut out.consumers[requester];
                    resp.external = true;
                    match access {
                        Access::Read { addr } => {
                            if let Some(data) = ext.read(now, requester, addr) {
                                resp.read_ready = true;
                                resp.read_data = data;
                                self.stats.requesters[requester].external_reads += 1;
                            }
                        }
                        Access::Write { addr, data } => {
                            resp.write_ready = ext.write(now, requester, addr, data);
                            if resp.write_ready {
                                self.stats.requesters[requester].external_writes += 1;
                            }
                        }
                    }
                }
            }
        }

        if let Some(access) = inputs.dma {
            match self.decoder.decode(access.addr(), &region) {
                Decoded::Resident { bank, offset, tile } => {
                    let tile_state = self.tiles.state(tile).unwrap_or_default();
                    let permitted = if access.is_write() {
                        self.tiles.dma_write_permitted(tile)
                    } else {
                        self.tiles.dma_read_permitted(tile)
                    };
                    if permitted {
                        matrix.set(dma_slot, bank, access.is_write());
                        ops[dma_slot] = Some(bank_op(access, offset));
                        out.arbitrated[dma_slot] = Some(Arbitrated {
                            bank,
                            tile,
                            tile_state,
                            is_write: access.is_write(),
                        });
                        activity[bank] = true;
                    } else {
                        out.dma.rejected = true;
                        self.stats.dma_rejects += 1;
                        violations.push(if access.is_write() {
                            ContractViolation::DmaWriteNotIdle {
                                tile,
                                state: tile_state,
                            }
                        } else {
                            ContractViolation::DmaReadNotReady {
                                tile,
                                state: tile_state,
                            }
                        });
                    }
                }
                Decoded::External | Decoded::Below => {
                    out.dma.rejected = true;
                    self.stats.dma_rejects += 1;
                    violations.push(ContractViolation::DmaOutOfRegion {
                        addr: access.addr(),
                    });
                }
            }
        }

        // Power reacts to this cycle's activity before the banks run, so an access wakes
        // its bank in time to be served. A running DMA job holds every bank up like an
        // in-flight tile does, since a load streams while its tile is still Idle.
        let in_flight = self.tiles.any_active() || inputs.dma_active;
        let transitions = self.power.step(&activity, in_flight, &inputs.power);
        for transition in &transitions {
            self.stats.banks[transition.bank].power_transitions += 1;
            if transition.to == PowerState::Sleep {
                self.banks.invalidate(transition.bank);
            }
        }
        let enables = self.power.enables();
        let outcome = self.arbiter.arbitrate_enabled(&matrix, &enables);

        let bank_ops: Vec<Option<BankOp>> = outcome
            .winners
            .iter()
            .map(|winner| winner.and_then(|w| ops[w]))
            .collect();
        let results = self.banks.execute(&bank_ops, &enables);

        for (bank, (winner, result)) in outcome.winners.iter().zip(&results).enumerate() {
            let Some(winner) = *winner else {
                continue;
            };
            let is_write = matrix.is_write(winner);
            self.stats.record_grant(winner, bank, is_write);
            if winner == dma_slot {
                match *result {
                    BankResult::Read(data) => {
                        out.dma.read_ready = true;
                        out.dma.read_data = data;
                        self.stats.dma_reads += 1;
                    }
                    BankResult::Written => {
                        out.dma.write_ready = true;
                        self.stats.dma_writes += 1;
                    }
                    BankResult::Dropped => self.stats.banks[bank].dropped += 1,
                    BankResult::NoOp => {}
                }
                continue;
            }
            let resp = &mut out.consumers[winner];
            match *result {
                BankResult::Read(data) => {
                    resp.read_ready = true;
                    resp.read_data = data;
                }
                BankResult::Written => resp.write_ready = true,
                BankResult::Dropped => {
                    self.stats.banks[bank].dropped += 1;
                    self.stats.requesters[winner].gated_drops += 1;
                }
                BankResult::NoOp => {}
            }
        }

        for slot in (0..slots).filter(|&s| outcome.conflict[s]) {
            let bank = matrix.bank_of(slot).unwrap_or_default();
            self.stats.record_conflict(slot, bank);
            if slot == dma_slot {
                out.dma.bank_conflict = true;
            } else {
                out.consumers[slot].bank_conflict = true;
            }
        }
        out.group_stall = outcome.group_stall.clone();
        out.arbitration = outcome;

        let tile_result = self.tiles.step(&inputs.commands, &reads_seen);
        out.tile_fence_done = tile_result.fence_done;
        if out.tile_fence_done {
            self.stats.fences_done += 1;
        }
        violations.extend(tile_result.violations);

        if let Some(next) = inputs.config_write {
            self.region.write(next);
            self.stats.config_writes += 1;
        }
        self.region.commit(&self.decoder);

        for violation in &violations {
            self.report(violation);
        }
        out.violations = violations;

        let power_states = self.power.states();
        self.stats.record_power(&power_states);
        out.banks = (0..num_banks)
            .filter_map(|bank| self.power.bank(bank))
            .map(|p| BankStatus {
                active: p.enabled(),
                power_state: p.state,
                needs_reload: p.needs_reload,
            })
            .collect();
        out.tile_states = self.tiles.states();

        debug!(
            "cycle {}: {} granted, {} conflicts",
            now,
            out.arbitration.num_granted(),
            out.arbitration.num_conflicts()
        );
        self.stats.cycles += 1;
        self.tick_one();
        out
    }

    fn report(&mut self, violation: &ContractViolation) {
        self.stats.record_violation(violation);
        match violation {
            // the normal retry path for a consumer that runs ahead of its tile
            ContractViolation::ReadNotVisible { .. } => debug!("must_stall: {}", violation),
            _ => warn!("contract violation at cycle {}: {}", self.cycle, violation),
        }
        if self.config.panic_on_violation {
            panic!("contract violation at cycle {}: {}", self.cycle, violation);
        }
    }
}

fn bank_op(access: Access, offset: usize) -> BankOp {
    match access {
        Access::Read { .. } => BankOp::Read { offset },
        Access::Write { data, .. } => BankOp::Write { offset, data },
    }
}

/// Requesters granted a given bank this cycle, for checking mutual exclusion.
pub fn grants_on_bank(outputs: &CycleOutputs, bank: BankId) -> Vec<RequesterId> {
    outputs
        .arbitrated
        .iter()
        .enumerate()
        .filter(|(slot, acc)| {
            acc.is_some_and(|a| a.bank == bank)
                && outputs.arbitration.granted.get(*slot).copied().unwrap_or(false)
        })
        .map(|(slot, _)| slot)
        .collect()
}
