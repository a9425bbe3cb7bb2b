use std::collections::BTreeMap;

use serde::Serialize;

use crate::tilebuf::power::PowerState;
use crate::tilebuf::types::{BankId, ContractViolation, RequesterId};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequesterStats {
    pub reads: u64,
    pub writes: u64,
    pub external_reads: u64,
    pub external_writes: u64,
    pub grants: u64,
    pub conflicts: u64,
    pub must_stalls: u64,
    pub gated_drops: u64,
    /// longest run of consecutive conflict cycles
    pub max_wait: u64,
    #[serde(skip)]
    wait_run: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BankStats {
    pub reads: u64,
    pub writes: u64,
    pub conflicts: u64,
    pub dropped: u64,
    pub power_transitions: u64,
    pub cycles_active: u64,
    pub cycles_idle: u64,
    pub cycles_sleep: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TileBufferStats {
    pub cycles: u64,
    pub requesters: Vec<RequesterStats>,
    pub banks: Vec<BankStats>,
    pub dma_reads: u64,
    pub dma_writes: u64,
    pub dma_rejects: u64,
    pub fences_done: u64,
    pub config_writes: u64,
    pub violations: BTreeMap<&'static str, u64>,
}

impl TileBufferStats {
    pub fn new(num_requesters: usize, num_banks: usize) -> Self {
        Self {
            requesters: vec![RequesterStats::default(); num_requesters],
            banks: vec![BankStats::default(); num_banks],
            ..Self::default()
        }
    }

    pub fn record_grant(&mut self, requester: RequesterId, bank: BankId, is_write: bool) {
        if let Some(r) = self.requesters.get_mut(requester) {
            r.grants += 1;
            r.wait_run = 0;
        }
        if let Some(b) = self.banks.get_mut(bank) {
            if is_write {
                b.writes += 1;
            } else {
                b.reads += 1;
            }
        }
    }

    pub fn record_conflict(&mut self, requester: RequesterId, bank: BankId) {
        if let Some(r) = self.requesters.get_mut(requester) {
            r.conflicts += 1;
            r.wait_run += 1;
            r.max_wait = r.max_wait.max(r.wait_run);
        }
        if let Some(b) = self.banks.get_mut(bank) {
            b.conflicts += 1;
        }
    }

    /// A requester that stopped contending no longer accumulates wait.
    pub fn record_idle(&mut self, requester: RequesterId) {
        if let Some(r) = self.requesters.get_mut(requester) {
            r.wait_run = 0;
        }
    }

    pub fn record_violation(&mut self, violation: &ContractViolation) {
        *self.violations.entry(violation.kind()).or_insert(0) += 1;
    }

    pub fn record_power(&mut self, states: &[PowerState]) {
        for (bank, state) in self.banks.iter_mut().zip(states) {
            match state {
                PowerState::Active => bank.cycles_active += 1,
                PowerState::Idle => bank.cycles_idle += 1,
                PowerState::Sleep => bank.cycles_sleep += 1,
            }
        }
    }

    pub fn total_violations(&self) -> u64 {
        self.violations.values().sum()
    }

    pub fn total_conflicts(&self) -> u64 {
        self.requesters.iter().map(|r| r.conflicts).sum()
    }

    pub fn total_grants(&self) -> u64 {
        self.requesters.iter().map(|r| r.grants).sum()
    }

    pub fn max_wait(&self) -> u64 {
        self.requesters.iter().map(|r| r.max_wait).max().unwrap_or(0)
    }
}
