use anyhow::bail;
use serde::Serialize;

use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::subsystem::CycleOutputs;
use crate::tilebuf::tile::TileState;
use crate::tilebuf::types::BankId;

#[derive(Debug, Clone)]
struct WaitRun {
    bank: BankId,
    cycles: u64,
    /// every slot seen contending for `bank` during the run
    contenders: Vec<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckerStats {
    pub cycles_checked: u64,
    pub grants_checked: u64,
    /// longest wait observed, in cycles, against the bound it had
    pub worst_wait: u64,
    pub worst_wait_bound: u64,
}

/// Validates every cycle's outputs against the arbitration and visibility properties:
/// at most one grant per bank, every pending slot either granted or flagged conflicting,
/// bounded wait under round-robin, and gated accesses never reaching the arbiter.
pub struct PropertyChecker {
    num_requesters: usize,
    num_banks: usize,
    dma_slot: usize,
    group_of: Vec<usize>,
    runs: Vec<Option<WaitRun>>,
    stats: CheckerStats,
}

impl PropertyChecker {
    pub fn new(config: &TileBufferConfig) -> Self {
        let slots = config.arbiter_slots();
        Self {
            num_requesters: config.num_requesters,
            num_banks: config.num_banks,
            dma_slot: config.dma_slot(),
            group_of: (0..config.num_requesters).map(|r| config.group_of(r)).collect(),
            runs: vec![None; slots],
            stats: CheckerStats::default(),
        }
    }

    pub fn stats(&self) -> &CheckerStats {
        &self.stats
    }

    pub fn check(&mut self, out: &CycleOutputs) -> anyhow::Result<()> {
        self.stats.cycles_checked += 1;
        self.check_mutual_exclusion(out)?;
        self.check_no_silent_conflict(out)?;
        self.check_visibility(out)?;
        self.check_group_stall(out)?;
        self.check_bounded_wait(out)
    }

    fn check_mutual_exclusion(&mut self, out: &CycleOutputs) -> anyhow::Result<()> {
        let mut grants = vec![0usize; self.num_banks];
        for (slot, acc) in out.arbitrated.iter().enumerate() {
            if let Some(acc) = acc {
                if out.arbitration.granted.get(slot).copied().unwrap_or(false) {
                    grants[acc.bank] += 1;
                    self.stats.grants_checked += 1;
                }
            }
        }
        if let Some(bank) = grants.iter().position(|&g| g > 1) {
            bail!(
                "cycle {}: bank {} granted to {} requesters",
                out.cycle,
                bank,
                grants[bank]
            );
        }
        for (bank, winner) in out.arbitration.winners.iter().enumerate() {
            let Some(winner) = *winner else {
                continue;
            };
            let targets = out
                .arbitrated
                .get(winner)
                .copied()
                .flatten()
                .map(|a| a.bank);
            if targets != Some(bank) {
                bail!(
                    "cycle {}: slot {} won bank {} without requesting it",
                    out.cycle,
                    winner,
                    bank
                );
            }
        }
        Ok(())
    }

    fn check_no_silent_conflict(&self, out: &CycleOutputs) -> anyhow::Result<()> {
        for (slot, acc) in out.arbitrated.iter().enumerate() {
            let granted = out.arbitration.granted.get(slot).copied().unwrap_or(false);
            let conflict = out.arbitration.conflict.get(slot).copied().unwrap_or(false);
            match (acc.is_some(), granted, conflict) {
                (true, true, false) | (true, false, true) | (false, false, false) => {}
                _ => bail!(
                    "cycle {}: slot {} pending={} granted={} conflict={}",
                    out.cycle,
                    slot,
                    acc.is_some(),
                    granted,
                    conflict
                ),
            }
        }
        Ok(())
    }

    fn check_visibility(&self, out: &CycleOutputs) -> anyhow::Result<()> {
        for (slot, acc) in out.arbitrated.iter().enumerate() {
            let Some(acc) = acc else {
                continue;
            };
            let legal = if slot == self.dma_slot {
                if acc.is_write {
                    acc.tile_state == TileState::Idle
                } else {
                    acc.tile_state == TileState::Ready
                }
            } else {
                acc.is_write || acc.tile_state.is_visible()
            };
            if !legal {
                bail!(
                    "cycle {}: slot {} {} tile {} reached the arbiter while {}",
                    out.cycle,
                    slot,
                    if acc.is_write { "write to" } else { "read of" },
                    acc.tile,
                    acc.tile_state
                );
            }
        }
        Ok(())
    }

    fn check_group_stall(&self, out: &CycleOutputs) -> anyhow::Result<()> {
        for (group, &stall) in out.group_stall.iter().enumerate() {
            let conflicted = (0..self.num_requesters).any(|r| {
                self.group_of[r] == group
                    && out.arbitration.conflict.get(r).copied().unwrap_or(false)
            });
            if stall != conflicted {
                bail!(
                    "cycle {}: group {} stall={} but conflict among members={}",
                    out.cycle,
                    group,
                    stall,
                    conflicted
                );
            }
        }
        Ok(())
    }

    /// Under per-bank round-robin a slot that keeps losing can only be passed over once by
    /// each other slot that contends for the bank during its wait.
    fn check_bounded_wait(&mut self, out: &CycleOutputs) -> anyhow::Result<()> {
        let slots = self.runs.len();
        for slot in 0..slots {
            let conflict = out.arbitration.conflict.get(slot).copied().unwrap_or(false);
            let bank = out.arbitrated.get(slot).copied().flatten().map(|a| a.bank);
            let (true, Some(bank)) = (conflict, bank) else {
                self.runs[slot] = None;
                continue;
            };

            let mut run = match self.runs[slot].take() {
                Some(run) if run.bank == bank => run,
                _ => WaitRun {
                    bank,
                    cycles: 0,
                    contenders: vec![false; slots],
                },
            };
            run.cycles += 1;
            for (other, acc) in out.arbitrated.iter().enumerate() {
                if acc.is_some_and(|a| a.bank == bank) {
                    run.contenders[other] = true;
                }
            }
            let bound = run.contenders.iter().filter(|&&c| c).count() as u64 - 1;
            if run.cycles > bound {
                bail!(
                    "cycle {}: slot {} waited {} cycles on bank {} with {} contenders",
                    out.cycle,
                    slot,
                    run.cycles,
                    bank,
                    bound + 1
                );
            }
            if run.cycles > self.stats.worst_wait {
                self.stats.worst_wait = run.cycles;
                self.stats.worst_wait_bound = bound;
            }
            self.runs[slot] = Some(run);
        }
        Ok(())
    }
}
