use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::{ensure, Context};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::base::behavior::*;
use crate::base::mem::ExternalMemory;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::config::Config;
use crate::tilebuf::power::PowerState;
use crate::tilebuf::subsystem::{CycleInputs, CycleOutputs, TileBuffer};
use crate::tilebuf::tile::TileState;
use crate::tilebuf::types::{Access, Addr, BankId, RequesterId, TileId, Word};
use crate::timeq::{Cycle, ServerConfig, TimedServer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DmaConfig {
    /// words staged per burst between the external tier and the scratchpad
    pub burst_words: usize,
    /// job setup: every queued job waits `base_latency` cycles before it may start;
    /// up to `queue_capacity` jobs are set up while another one streams
    #[serde(flatten)]
    pub setup: ServerConfig,
}

impl Config for DmaConfig {}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            burst_words: 8,
            setup: ServerConfig {
                base_latency: 2,
                queue_capacity: 2,
            },
        }
    }
}

impl DmaConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.burst_words > 0, "burst_words must be > 0");
        self.setup.validate().context("invalid dma setup queue")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DmaJob {
    /// external -> tile, then `tile_load` and `dma_write_done`
    Load { tile: TileId, ext_addr: Addr },
    /// tile -> external, then `tile_store` and `dma_read_done`
    Store { tile: TileId, ext_addr: Addr },
}

impl DmaJob {
    pub fn tile(&self) -> TileId {
        match *self {
            DmaJob::Load { tile, .. } | DmaJob::Store { tile, .. } => tile,
        }
    }

    pub fn ext_addr(&self) -> Addr {
        match *self {
            DmaJob::Load { ext_addr, .. } | DmaJob::Store { ext_addr, .. } => ext_addr,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, DmaJob::Load { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// staging words into the burst buffer
    Fill,
    /// emptying the burst buffer into the destination
    Drain,
    /// command issued, waiting for the tile to take it
    Command,
    /// completion pulse issued, waiting for the tile to settle
    Pulse,
}

#[derive(Debug)]
struct ActiveJob {
    job: DmaJob,
    first: Addr,
    last: Addr,
    /// next scratchpad address to stage
    cursor: Addr,
    /// (scratchpad address, word)
    burst: VecDeque<(Addr, Word)>,
    phase: Phase,
    queued_at: Cycle,
    started_at: Cycle,
}

impl ActiveJob {
    fn ext_addr(&self, addr: Addr) -> Addr {
        self.job.ext_addr() + (addr - self.first)
    }

    fn staged_all(&self) -> bool {
        self.cursor > self.last
    }

    fn restart(&mut self) {
        self.cursor = self.first;
        self.burst.clear();
        self.phase = Phase::Fill;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DmaCompletion {
    pub job: DmaJob,
    pub queued_at: Cycle,
    pub started_at: Cycle,
    pub finished_at: Cycle,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DmaStats {
    pub jobs_done: u64,
    pub jobs_aborted: u64,
    /// loads re-streamed from their first word after a covered bank lost power
    pub jobs_restarted: u64,
    pub words_loaded: u64,
    pub words_stored: u64,
    pub port_conflicts: u64,
    pub reloads_acked: u64,
}

pub struct DmaState {
    pending: VecDeque<DmaJob>,
    setup: TimedServer<DmaJob>,
    active: Option<ActiveJob>,
    /// banks whose reload is acknowledged on the next cycle
    reload_ack: Vec<bool>,
    /// per bank: live tiles whose words there were lost and have not been reloaded
    owed: Vec<BTreeSet<TileId>>,
    /// per bank: asleep after the last observed cycle
    asleep: Vec<bool>,
    completed: Vec<DmaCompletion>,
    stats: DmaStats,
}

/// Moves whole tiles between the external tier and the scratchpad through the tile buffer's
/// DMA port, one word per granted cycle. The engine stages up to `burst_words` words, drains
/// them, and repeats; arbitration losses are retried on the next cycle.
///
/// The engine is also the reload controller: it watches bank power and acknowledges
/// `reload_done` for a bank only once no live tile is still missing words there.
pub struct DmaEngine {
    base: ModuleBase<DmaState, DmaConfig>,
    port: RequesterId,
}

module!(DmaEngine, DmaState, DmaConfig,);

impl ModuleBehaviors for DmaEngine {
    fn tick_one(&mut self) {
        self.base.cycle += 1;
    }

    fn reset(&mut self) {
        let state = &mut self.base.state;
        state.pending.clear();
        state.setup.clear();
        state.active = None;
        state.reload_ack.clear();
        state.owed.clear();
        state.asleep.clear();
    }
}

impl DmaEngine {
    /// `port` identifies the engine to the external tier. `config` is expected to have
    /// passed [`DmaConfig::validate`].
    pub fn new(config: Arc<DmaConfig>, port: RequesterId) -> Self {
        let setup = TimedServer::new(config.setup);
        let mut me = DmaEngine {
            base: ModuleBase::with_state(DmaState {
                pending: VecDeque::new(),
                setup,
                active: None,
                reload_ack: Vec::new(),
                owed: Vec::new(),
                asleep: Vec::new(),
                completed: Vec::new(),
                stats: DmaStats::default(),
            }),
            port,
        };
        me.init_conf(config);
        me
    }

    pub fn submit(&mut self, job: DmaJob) {
        debug!("dma: queued {:?}", job);
        self.base.state.pending.push_back(job);
    }

    pub fn is_busy(&self) -> bool {
        let state = &self.base.state;
        !state.pending.is_empty() || !state.setup.is_empty() || state.active.is_some()
    }

    pub fn completed(&self) -> &[DmaCompletion] {
        &self.base.state.completed
    }

    pub fn stats(&self) -> &DmaStats {
        &self.base.state.stats
    }

    pub fn current(&self) -> Option<DmaJob> {
        self.base.state.active.as_ref().map(|a| a.job)
    }

    /// Live tiles still owed a reload in `bank`.
    pub fn owed_reloads(&self, bank: BankId) -> Vec<TileId> {
        self.base
            .state
            .owed
            .get(bank)
            .map(|owed| owed.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drive this cycle's DMA port, tile commands and reload acknowledgements into `inputs`.
    /// External-tier traffic of the engine happens here as well.
    pub fn drive(
        &mut self,
        tilebuf: &TileBuffer,
        inputs: &mut CycleInputs,
        ext: &mut dyn ExternalMemory,
    ) {
        let now = self.base.cycle;
        let port = self.port;
        let burst_words = self.conf().burst_words;

        if !self.base.state.reload_ack.is_empty() {
            inputs.power.reload_done = std::mem::take(&mut self.base.state.reload_ack);
        }
        self.start_next(now, tilebuf);

        let state = &mut self.base.state;
        let Some(active) = state.active.as_mut() else {
            return;
        };
        inputs.dma_active = true;
        match (active.job, active.phase) {
            (DmaJob::Load { .. }, Phase::Fill) => {
                let ext_addr = active.ext_addr(active.cursor);
                if let Some(data) = ext.read(now, port, ext_addr) {
                    active.burst.push_back((active.cursor, data));
                    active.cursor += 1;
                    if active.burst.len() >= burst_words || active.staged_all() {
                        active.phase = Phase::Drain;
                    }
                }
            }
            (DmaJob::Load { .. }, Phase::Drain) => {
                if let Some(&(addr, data)) = active.burst.front() {
                    inputs.dma = Some(Access::Write { addr, data });
                }
            }
            (DmaJob::Store { .. }, Phase::Fill) => {
                inputs.dma = Some(Access::Read {
                    addr: active.cursor,
                });
            }
            (DmaJob::Store { .. }, Phase::Drain) => {
                if let Some(&(addr, data)) = active.burst.front() {
                    let ext_addr = active.ext_addr(addr);
                    if ext.write(now, port, ext_addr, data) {
                        active.burst.pop_front();
                        state.stats.words_stored += 1;
                        if active.burst.is_empty() {
                            active.phase = if active.staged_all() {
                                Phase::Command
                            } else {
                                Phase::Fill
                            };
                        }
                    }
                }
            }
            (DmaJob::Load { tile, .. }, Phase::Command) => inputs.commands.load = Some(tile),
            (DmaJob::Store { tile, .. }, Phase::Command) => inputs.commands.store = Some(tile),
            (DmaJob::Load { .. }, Phase::Pulse) => inputs.commands.dma_write_done = true,
            (DmaJob::Store { .. }, Phase::Pulse) => inputs.commands.dma_read_done = true,
        }
    }

    /// Consume the tile buffer's response to what [`DmaEngine::drive`] presented.
    pub fn observe(&mut self, tilebuf: &TileBuffer, outputs: &CycleOutputs) {
        let slept = self.track_power(tilebuf, outputs);
        self.advance_job(outputs);

        let state = &mut self.base.state;
        let Some(active) = state.active.as_mut() else {
            return;
        };
        // Words already written to a bank that lost power are gone; stream the tile again.
        // Until the tile takes `tile_load` it is Idle and nobody else owes it a reload.
        let tile = active.job.tile();
        if active.job.is_load()
            && matches!(active.phase, Phase::Fill | Phase::Drain | Phase::Command)
            && slept.iter().any(|&bank| tilebuf.tile_covers_bank(tile, bank))
        {
            warn!("dma: bank lost power under {:?}, restarting", active.job);
            active.restart();
            state.stats.jobs_restarted += 1;
        }
    }

    /// Record banks that fell asleep this cycle and the live tiles they took words from.
    /// Tiles back in Idle hold nothing worth reloading.
    fn track_power(
        &mut self,
        tilebuf: &TileBuffer,
        outputs: &CycleOutputs,
    ) -> SmallVec<[BankId; 4]> {
        let state = &mut self.base.state;
        let num_banks = outputs.banks.len();
        state.owed.resize_with(num_banks, BTreeSet::new);
        state.asleep.resize(num_banks, false);

        let mut slept = SmallVec::new();
        for (bank, status) in outputs.banks.iter().enumerate() {
            let asleep = status.power_state == PowerState::Sleep;
            if asleep && !state.asleep[bank] {
                slept.push(bank);
                for (tile, &tile_state) in outputs.tile_states.iter().enumerate() {
                    if tile_state != TileState::Idle && tilebuf.tile_covers_bank(tile, bank) {
                        state.owed[bank].insert(tile);
                    }
                }
            }
            state.asleep[bank] = asleep;
        }
        for owed in &mut state.owed {
            owed.retain(|&tile| outputs.tile_states.get(tile) != Some(&TileState::Idle));
        }
        slept
    }

    fn advance_job(&mut self, outputs: &CycleOutputs) {
        let now = self.base.cycle;
        let burst_words = self.conf().burst_words;
        let state = &mut self.base.state;
        let Some(active) = state.active.as_mut() else {
            return;
        };
        let tile = active.job.tile();
        let tile_state = outputs.tile_states.get(tile).copied().unwrap_or_default();

        if outputs.dma.bank_conflict {
            state.stats.port_conflicts += 1;
        }
        if outputs.dma.rejected {
            warn!(
                "dma: {:?} refused while tile {} is {}, aborting",
                active.job, tile, tile_state
            );
            state.stats.jobs_aborted += 1;
            state.active = None;
            return;
        }

        let mut finished = false;
        match (active.job, active.phase) {
            (DmaJob::Load { .. }, Phase::Drain) if outputs.dma.write_ready => {
                active.burst.pop_front();
                state.stats.words_loaded += 1;
                if active.burst.is_empty() {
                    active.phase = if active.staged_all() {
                        Phase::Command
                    } else {
                        Phase::Fill
                    };
                }
            }
            (DmaJob::Store { .. }, Phase::Fill) if outputs.dma.read_ready => {
                active.burst.push_back((active.cursor, outputs.dma.read_data));
                active.cursor += 1;
                if active.burst.len() >= burst_words || active.staged_all() {
                    active.phase = Phase::Drain;
                }
            }
            (DmaJob::Load { .. }, Phase::Command) if tile_state == TileState::Loading => {
                active.phase = Phase::Pulse;
            }
            (DmaJob::Store { .. }, Phase::Command) if tile_state == TileState::Evicting => {
                active.phase = Phase::Pulse;
            }
            (DmaJob::Load { .. }, Phase::Pulse) if tile_state == TileState::Ready => {
                // Acknowledge banks no live tile is still waiting on. A bank that slept
                // after this tile finished streaming keeps the tile in its owed set.
                state.reload_ack = outputs
                    .banks
                    .iter()
                    .zip(&state.owed)
                    .map(|(status, owed)| status.needs_reload && owed.is_empty())
                    .collect();
                finished = true;
            }
            (DmaJob::Store { .. }, Phase::Pulse) if tile_state == TileState::Idle => {
                finished = true;
            }
            (_, Phase::Command) => {
                warn!("dma: tile {} did not take {:?} (state {})", tile, active.job, tile_state);
                state.stats.jobs_aborted += 1;
                state.active = None;
                return;
            }
            _ => {}
        }

        if finished {
            let completion = DmaCompletion {
                job: active.job,
                queued_at: active.queued_at,
                started_at: active.started_at,
                finished_at: now,
            };
            info!(
                "dma: {:?} done in {} cycles ({} after queueing)",
                completion.job,
                now - completion.started_at,
                now - completion.queued_at
            );
            state.stats.reloads_acked += state.reload_ack.iter().filter(|&&r| r).count() as u64;
            state.completed.push(completion);
            state.stats.jobs_done += 1;
            state.active = None;
        }
    }

    /// Queued jobs go through setup while another job streams; the oldest job whose setup
    /// elapsed starts once the port is free.
    fn start_next(&mut self, now: Cycle, tilebuf: &TileBuffer) {
        let state = &mut self.base.state;
        while !state.setup.is_full() {
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            if let Err(full) = state.setup.try_enqueue(now, job) {
                state.pending.push_front(full.payload);
                break;
            }
        }
        if state.active.is_some() {
            return;
        }

        let Some((job, ticket)) = state.setup.pop_ready(now) else {
            return;
        };
        let Some((first, last)) = tilebuf.tile_range(job.tile()) else {
            warn!("dma: tile {} has no resident range, dropping {:?}", job.tile(), job);
            state.stats.jobs_aborted += 1;
            return;
        };
        debug!("dma: start {:?} over [{:#x}, {:#x}]", job, first, last);
        state.active = Some(ActiveJob {
            job,
            first,
            last,
            cursor: first,
            burst: VecDeque::new(),
            phase: Phase::Fill,
            queued_at: ticket.issued_at(),
            started_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::config::ExtMemConfig;
    use crate::sim::ext_mem::LatencyMemory;
    use crate::tilebuf::config::TileBufferConfig;

    fn run_until_idle(
        dma: &mut DmaEngine,
        tb: &mut TileBuffer,
        ext: &mut LatencyMemory,
        limit: usize,
    ) {
        for _ in 0..limit {
            if !dma.is_busy() {
                return;
            }
            let mut inputs = CycleInputs::idle(tb.config().num_requesters);
            dma.drive(tb, &mut inputs, ext);
            let outputs = tb.step(&inputs, ext);
            dma.observe(tb, &outputs);
            dma.tick_one();
        }
        panic!("dma still busy after {} cycles", limit);
    }

    #[test]
    fn load_then_store_round_trips_a_tile() {
        let tb_config = Arc::new(TileBufferConfig::default());
        let mut tb = TileBuffer::new(Arc::clone(&tb_config)).unwrap();
        let mut ext = LatencyMemory::new(&ExtMemConfig { base_latency: 1 });
        let mut dma = DmaEngine::new(Arc::new(DmaConfig::default()), tb_config.dma_slot());

        let (first, last) = tb.tile_range(1).unwrap();
        for i in 0..=(last - first) {
            ext.poke(0x1000 + i, 0xA000 + i);
        }
        dma.submit(DmaJob::Load {
            tile: 1,
            ext_addr: 0x1000,
        });
        run_until_idle(&mut dma, &mut tb, &mut ext, 1000);
        assert_eq!(Some(TileState::Ready), tb.tile_state(1));
        assert_eq!(Some(0xA000), tb.peek(first));
        assert_eq!(Some(0xA000 + last - first), tb.peek(last));

        dma.submit(DmaJob::Store {
            tile: 1,
            ext_addr: 0x2000,
        });
        run_until_idle(&mut dma, &mut tb, &mut ext, 1000);
        assert_eq!(Some(TileState::Idle), tb.tile_state(1));
        for i in 0..=(last - first) {
            assert_eq!(0xA000 + i, ext.peek(0x2000 + i));
        }
        assert_eq!(2, dma.stats().jobs_done);
        assert_eq!(0, dma.stats().jobs_aborted);
        assert_eq!(0, tb.stats().total_violations());
    }

    #[test]
    fn store_of_idle_tile_is_aborted() {
        let tb_config = Arc::new(TileBufferConfig::default());
        let mut tb = TileBuffer::new(Arc::clone(&tb_config)).unwrap();
        let mut ext = LatencyMemory::new(&ExtMemConfig { base_latency: 0 });
        let mut dma = DmaEngine::new(Arc::new(DmaConfig::default()), tb_config.dma_slot());

        dma.submit(DmaJob::Store {
            tile: 0,
            ext_addr: 0,
        });
        run_until_idle(&mut dma, &mut tb, &mut ext, 100);
        assert_eq!(1, dma.stats().jobs_aborted);
        assert_eq!(Some(&1), tb.stats().violations.get("dma_read_not_ready"));
    }
}
