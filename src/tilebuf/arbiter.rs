use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::types::{BankId, RequesterId};

pub type Contenders = SmallVec<[RequesterId; 8]>;

/// Dense requesters x banks matrix, rebuilt every cycle. Each requester occupies at most one
/// bank per cycle.
#[derive(Debug, Clone)]
pub struct RequestMatrix {
    num_slots: usize,
    num_banks: usize,
    pending: Vec<bool>,
    is_write: Vec<bool>,
}

impl RequestMatrix {
    pub fn new(num_slots: usize, num_banks: usize) -> Self {
        Self {
            num_slots,
            num_banks,
            pending: vec![false; num_slots * num_banks],
            is_write: vec![false; num_slots],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    /// Register `requester`'s access to `bank`, replacing any earlier entry for this cycle.
    pub fn set(&mut self, requester: RequesterId, bank: BankId, is_write: bool) {
        assert!(requester < self.num_slots, "requester {} out of range", requester);
        assert!(bank < self.num_banks, "bank {} out of range", bank);
        let row = requester * self.num_banks;
        self.pending[row..row + self.num_banks].fill(false);
        self.pending[row + bank] = true;
        self.is_write[requester] = is_write;
    }

    pub fn is_pending(&self, requester: RequesterId, bank: BankId) -> bool {
        self.pending[requester * self.num_banks + bank]
    }

    /// The bank a requester targets this cycle, if any.
    pub fn bank_of(&self, requester: RequesterId) -> Option<BankId> {
        let row = requester * self.num_banks;
        self.pending[row..row + self.num_banks]
            .iter()
            .position(|&p| p)
    }

    pub fn is_write(&self, requester: RequesterId) -> bool {
        self.is_write[requester]
    }

    pub fn contenders(&self, bank: BankId) -> Contenders {
        (0..self.num_slots)
            .filter(|&r| self.is_pending(r, bank))
            .collect()
    }

    pub fn clear(&mut self) {
        self.pending.fill(false);
        self.is_write.fill(false);
    }
}

/// First requester, scanning from `pointer` upward with wrap-around, that satisfies `pending`.
pub fn rotating_pick(
    pointer: usize,
    num_slots: usize,
    pending: impl Fn(RequesterId) -> bool,
) -> Option<RequesterId> {
    (0..num_slots)
        .map(|i| (pointer + i) % num_slots)
        .find(|&r| pending(r))
}

#[derive(Debug, Clone, Default)]
pub struct ArbiterOutcome {
    /// per bank: the single requester granted this cycle
    pub winners: Vec<Option<RequesterId>>,
    /// per slot
    pub granted: Vec<bool>,
    /// per slot: pending on a contended bank but not granted
    pub conflict: Vec<bool>,
    /// per stall group
    pub group_stall: Vec<bool>,
}

impl ArbiterOutcome {
    pub fn num_granted(&self) -> usize {
        self.granted.iter().filter(|&&g| g).count()
    }

    pub fn num_conflicts(&self) -> usize {
        self.conflict.iter().filter(|&&c| c).count()
    }
}

#[derive(Debug, Default)]
pub struct ArbiterState {
    /// per bank rotating priority pointer
    pointers: Vec<RequesterId>,
}

/// Per-bank round-robin arbiter. The pointer of a bank moves to one past its winner, so a
/// requester that keeps contending for a bank with `n` contenders waits at most `n - 1` cycles.
pub struct BankArbiter {
    base: ModuleBase<ArbiterState, TileBufferConfig>,
}

module!(BankArbiter, ArbiterState, TileBufferConfig,);

impl ModuleBehaviors for BankArbiter {
    fn tick_one(&mut self) {
        self.base.cycle += 1;
    }

    fn reset(&mut self) {
        self.base.state.pointers.fill(0);
    }
}

impl BankArbiter {
    pub fn new(config: Arc<TileBufferConfig>) -> Self {
        let mut me = BankArbiter {
            base: ModuleBase::with_state(ArbiterState {
                pointers: vec![0; config.num_banks],
            }),
        };
        me.init_conf(config);
        me
    }

    pub fn pointer(&self, bank: BankId) -> RequesterId {
        self.base.state.pointers[bank]
    }

    pub fn pointers(&self) -> &[RequesterId] {
        &self.base.state.pointers
    }

    pub fn arbitrate(&mut self, matrix: &RequestMatrix) -> ArbiterOutcome {
        self.arbitrate_enabled(matrix, &[])
    }

    /// Arbitrate with per-bank enables. A disabled bank still picks a winner, but the grant
    /// cannot be served, so its pointer stays put. Banks missing from `enabled` count as enabled.
    pub fn arbitrate_enabled(&mut self, matrix: &RequestMatrix, enabled: &[bool]) -> ArbiterOutcome {
        let num_slots = matrix.num_slots();
        let num_banks = matrix.num_banks();
        debug_assert_eq!(num_slots, self.conf().arbiter_slots());
        debug_assert_eq!(num_banks, self.base.state.pointers.len());

        let mut outcome = ArbiterOutcome {
            winners: vec![None; num_banks],
            granted: vec![false; num_slots],
            conflict: vec![false; num_slots],
            group_stall: vec![false; self.conf().num_groups()],
        };

        for bank in 0..num_banks {
            let pointer = self.base.state.pointers[bank];
            let Some(winner) = rotating_pick(pointer, num_slots, |r| matrix.is_pending(r, bank))
            else {
                continue;
            };
            outcome.winners[bank] = Some(winner);
            outcome.granted[winner] = true;
            if enabled.get(bank).copied().unwrap_or(true) {
                self.base.state.pointers[bank] = (winner + 1) % num_slots;
            }

            for loser in matrix.contenders(bank).into_iter().filter(|&r| r != winner) {
                outcome.conflict[loser] = true;
                debug!("bank {} conflict: requester {} lost to {}", bank, loser, winner);
            }
        }

        let dma_slot = self.conf().dma_slot();
        for requester in (0..num_slots).filter(|&r| r != dma_slot) {
            if outcome.conflict[requester] {
                let group = self.conf().group_of(requester);
                outcome.group_stall[group] = true;
            }
        }
        outcome
    }
}
