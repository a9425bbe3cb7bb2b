use std::sync::Arc;

use anyhow::{bail, Context};
use log::{error, info};

use crate::base::behavior::*;
use crate::sim::config::{ExtMemConfig, SimConfig};
use crate::sim::ext_mem::LatencyMemory;
use crate::sim::perf_log::{write_summary, PhaseRecord, RunSummary};
use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::dma::{DmaConfig, DmaEngine, DmaJob};
use crate::tilebuf::subsystem::{CycleInputs, CycleOutputs, TileBuffer};
use crate::tilebuf::types::{Addr, TileId, Word};
use crate::timeq::Cycle;
use crate::traffic::checker::PropertyChecker;
use crate::traffic::config::TrafficConfig;
use crate::traffic::driver::TrafficDriver;
use crate::traffic::patterns::{PatternEngine, TileLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Load,
    Traffic,
    Fence,
    Store,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Load => "load",
            Phase::Traffic => "traffic",
            Phase::Fence => "fence",
            Phase::Store => "store",
        }
    }
}

/// Initial contents of word `i` of tile `tile` in the external tier.
pub fn seed_word(tile: TileId, i: u64) -> Word {
    0x7100_0000_0000_0000 | ((tile as Word) << 32) | i
}

/// Top level: loads the configured tiles through the DMA engine, runs the consumer workload
/// against them, fences, stores them back and checks the external tier holds what the
/// workload wrote. Every cycle is checked by the property checker.
pub struct Sim {
    config: SimConfig,
    traffic_config: TrafficConfig,
    tilebuf: TileBuffer,
    dma: DmaEngine,
    ext: LatencyMemory,
    driver: TrafficDriver,
    checker: PropertyChecker,
    phases: Vec<PhaseRecord>,
}

impl Sim {
    pub fn new(
        config: SimConfig,
        tilebuf_config: TileBufferConfig,
        dma_config: DmaConfig,
        ext_config: ExtMemConfig,
        traffic_config: TrafficConfig,
    ) -> anyhow::Result<Self> {
        let tilebuf_config = Arc::new(tilebuf_config);
        let tilebuf = TileBuffer::new(Arc::clone(&tilebuf_config)).context("invalid [tilebuf] config")?;
        let num_requesters = tilebuf_config.num_requesters;
        dma_config.validate().context("invalid [dma] config")?;

        for &tile in &traffic_config.tiles {
            if tilebuf.tile_range(tile).is_none() {
                bail!("tile {} has no resident range in the configured region", tile);
            }
        }
        if traffic_config.enabled {
            if let Some(p) = traffic_config
                .patterns
                .iter()
                .find(|p| !traffic_config.tiles.contains(&p.tile))
            {
                bail!("traffic pattern targets tile {} which is never loaded", p.tile);
            }
        }
        let engine = if traffic_config.enabled {
            PatternEngine::new(&traffic_config, TileLayout::of(&tilebuf), num_requesters)?
        } else {
            PatternEngine::default()
        };

        Ok(Self {
            dma: DmaEngine::new(Arc::new(dma_config), tilebuf_config.dma_slot()),
            ext: LatencyMemory::new(&ext_config),
            driver: TrafficDriver::new(&traffic_config, engine, num_requesters),
            checker: PropertyChecker::new(&tilebuf_config),
            phases: Vec::new(),
            config,
            traffic_config,
            tilebuf,
        })
    }

    /// Return every component to its reset state. Bank contents and the external tier
    /// are not reset.
    pub fn reset(&mut self) {
        self.tilebuf.reset();
        self.dma.reset();
        self.phases.clear();
    }

    pub fn tilebuf(&self) -> &TileBuffer {
        &self.tilebuf
    }

    pub fn ext(&self) -> &LatencyMemory {
        &self.ext
    }

    fn tile_words(&self, tile: TileId) -> Vec<Addr> {
        self.tilebuf
            .tile_range(tile)
            .map(|(first, last)| (first..=last).collect())
            .unwrap_or_default()
    }

    fn ext_addr(&self, base: Addr, tile: TileId, addr: Addr) -> Addr {
        let first = self.tilebuf.tile_range(tile).map_or(addr, |(first, _)| first);
        base + tile as Addr * self.traffic_config.ext_stride + (addr - first)
    }

    /// Advance the whole system by one cycle.
    fn cycle(&mut self, phase: Phase, fence: Option<TileId>) -> anyhow::Result<CycleOutputs> {
        let now = self.tilebuf.cycle();
        if now >= self.config.timeout {
            bail!("timed out after {} cycles in the {} phase", now, phase.name());
        }

        let mut inputs = CycleInputs::idle(self.tilebuf.config().num_requesters);
        self.dma.drive(&self.tilebuf, &mut inputs, &mut self.ext);
        if phase == Phase::Traffic {
            self.driver.drive(now, &mut inputs);
        }
        inputs.commands.fence = fence;

        let outputs = self.tilebuf.step(&inputs, &mut self.ext);
        self.dma.observe(&self.tilebuf, &outputs);
        if phase == Phase::Traffic {
            self.driver.observe(&outputs);
        }
        self.dma.tick_one();
        self.checker
            .check(&outputs)
            .with_context(|| format!("property violated in the {} phase", phase.name()))?;
        Ok(outputs)
    }

    fn run_dma(&mut self, phase: Phase) -> anyhow::Result<()> {
        while self.dma.is_busy() {
            self.cycle(phase, None)?;
        }
        Ok(())
    }

    fn record_phase(&mut self, phase: Phase, start: Cycle) {
        let end = self.tilebuf.cycle();
        info!("{} phase: cycles {}..{}", phase.name(), start, end);
        self.phases.push(PhaseRecord {
            name: phase.name().to_string(),
            start,
            end,
        });
    }

    pub fn simulate(&mut self) -> anyhow::Result<RunSummary> {
        let tiles = self.traffic_config.tiles.clone();
        let ext_base = self.traffic_config.ext_base;
        let store_base = self.traffic_config.store_base;

        let start = self.tilebuf.cycle();
        for &tile in &tiles {
            for (i, addr) in self.tile_words(tile).into_iter().enumerate() {
                let ext_addr = self.ext_addr(ext_base, tile, addr);
                self.ext.poke(ext_addr, seed_word(tile, i as u64));
                self.driver.seed(addr, seed_word(tile, i as u64));
            }
            let first = self.tile_words(tile).first().copied().unwrap_or(0);
            self.dma.submit(DmaJob::Load {
                tile,
                ext_addr: self.ext_addr(ext_base, tile, first),
            });
        }
        self.run_dma(Phase::Load)?;
        self.record_phase(Phase::Load, start);

        let start = self.tilebuf.cycle();
        while !self.driver.is_done() {
            self.cycle(Phase::Traffic, None)?;
        }
        self.record_phase(Phase::Traffic, start);

        let start = self.tilebuf.cycle();
        for &tile in &tiles {
            while !self.cycle(Phase::Fence, Some(tile))?.tile_fence_done {}
        }
        self.record_phase(Phase::Fence, start);

        let start = self.tilebuf.cycle();
        for &tile in &tiles {
            let first = self.tile_words(tile).first().copied().unwrap_or(0);
            self.dma.submit(DmaJob::Store {
                tile,
                ext_addr: self.ext_addr(store_base, tile, first),
            });
        }
        self.run_dma(Phase::Store)?;
        self.record_phase(Phase::Store, start);

        let mut verified_words = 0;
        let mut mismatches = 0;
        for &tile in &tiles {
            for addr in self.tile_words(tile) {
                let stored = self.ext.peek(self.ext_addr(store_base, tile, addr));
                match self.driver.expected(addr) {
                    Some(expected) if expected == stored => verified_words += 1,
                    expected => {
                        mismatches += 1;
                        error!(
                            "tile {} word {:#x}: stored {:#x}, expected {:?}",
                            tile, addr, stored, expected
                        );
                    }
                }
            }
        }

        let summary = RunSummary {
            cycles: self.tilebuf.cycle(),
            phases: self.phases.clone(),
            tilebuf: self.tilebuf.stats().clone(),
            dma: self.dma.stats().clone(),
            traffic: self.driver.stats().clone(),
            checker: self.checker.stats().clone(),
            ext_reads: self.ext.reads(),
            ext_writes: self.ext.writes(),
            verified_words,
            mismatches,
        };
        if let Some(path) = &self.config.results_json {
            write_summary(path, &summary)?;
        }

        if self.dma.stats().jobs_aborted > 0 {
            bail!("{} dma jobs aborted", self.dma.stats().jobs_aborted);
        }
        if mismatches > 0 || summary.traffic.data_mismatches > 0 {
            bail!(
                "{} stored words and {} reads did not match the workload",
                mismatches,
                summary.traffic.data_mismatches
            );
        }
        info!(
            "simulation finished in {} cycles: {} words verified, {} grants, {} conflicts, max wait {}",
            summary.cycles,
            verified_words,
            summary.tilebuf.total_grants(),
            summary.tilebuf.total_conflicts(),
            summary.tilebuf.max_wait()
        );
        Ok(summary)
    }
}
