use std::sync::Arc;

use log::{debug, warn};

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::tilebuf::config::TileBufferConfig;
use crate::tilebuf::types::{BankId, BankOp, Word};

/// Pattern written over a bank's contents when it loses power.
pub const POISON_WORD: Word = 0xDEAD_DEAD_DEAD_DEAD;

/// Registered outputs of one bank for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankResponse {
    pub read_ready: bool,
    pub read_data: Word,
    pub write_ready: bool,
}

/// Single bank with one read port and one write port. Both ports are serviced in the cycle
/// they are presented, provided the bank is enabled; a read and write to the same word in the
/// same cycle returns the old value.
#[derive(Debug, Clone)]
pub struct BankStore {
    words: Vec<Word>,
}

impl BankStore {
    pub fn new(depth: usize) -> Self {
        Self {
            words: vec![0; depth],
        }
    }

    pub fn depth(&self) -> usize {
        self.words.len()
    }

    pub fn cycle(
        &mut self,
        enable: bool,
        read: Option<usize>,
        write: Option<(usize, Word)>,
    ) -> BankResponse {
        let mut resp = BankResponse::default();
        if !enable {
            return resp;
        }
        if let Some(offset) = read {
            match self.words.get(offset) {
                Some(&data) => {
                    resp.read_ready = true;
                    resp.read_data = data;
                }
                None => warn!("bank read offset {} beyond depth {}", offset, self.depth()),
            }
        }
        if let Some((offset, data)) = write {
            match self.words.get_mut(offset) {
                Some(word) => {
                    *word = data;
                    resp.write_ready = true;
                }
                None => warn!("bank write offset {} beyond depth {}", offset, self.depth()),
            }
        }
        resp
    }

    /// Contents are gone after a power-down.
    pub fn invalidate(&mut self) {
        self.words.fill(POISON_WORD);
    }

    /// Backdoor read that bypasses ports and power state.
    pub fn peek(&self, offset: usize) -> Option<Word> {
        self.words.get(offset).copied()
    }

    /// Backdoor write that bypasses ports and power state.
    pub fn poke(&mut self, offset: usize, data: Word) -> bool {
        match self.words.get_mut(offset) {
            Some(word) => {
                *word = data;
                true
            }
            None => false,
        }
    }
}

/// Result of the single granted operation a bank executed this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankResult {
    NoOp,
    Read(Word),
    Written,
    /// the bank was disabled and silently ignored the operation
    Dropped,
}

#[derive(Debug, Default)]
pub struct BankArrayState {
    banks: Vec<BankStore>,
}

pub struct BankArray {
    base: ModuleBase<BankArrayState, TileBufferConfig>,
}

module!(BankArray, BankArrayState, TileBufferConfig,);

impl ModuleBehaviors for BankArray {
    fn tick_one(&mut self) {
        self.base.cycle += 1;
    }

    // Contents are not architecturally reset.
    fn reset(&mut self) {}
}

impl BankArray {
    pub fn new(config: Arc<TileBufferConfig>) -> Self {
        let banks = (0..config.num_banks)
            .map(|_| BankStore::new(config.bank_depth))
            .collect();
        let mut me = BankArray {
            base: ModuleBase::with_state(BankArrayState { banks }),
        };
        me.init_conf(config);
        me
    }

    pub fn num_banks(&self) -> usize {
        self.base.state.banks.len()
    }

    /// Execute at most one operation per bank. `ops` and `enable` are indexed by bank id.
    pub fn execute(&mut self, ops: &[Option<BankOp>], enable: &[bool]) -> Vec<BankResult> {
        debug_assert_eq!(ops.len(), self.num_banks());
        debug_assert_eq!(enable.len(), self.num_banks());
        self.base
            .state
            .banks
            .iter_mut()
            .zip(ops.iter().zip(enable))
            .map(|(bank, (op, &enabled))| match *op {
                None => BankResult::NoOp,
                Some(BankOp::Read { offset }) => {
                    let resp = bank.cycle(enabled, Some(offset), None);
                    if resp.read_ready {
                        BankResult::Read(resp.read_data)
                    } else {
                        BankResult::Dropped
                    }
                }
                Some(BankOp::Write { offset, data }) => {
                    let resp = bank.cycle(enabled, None, Some((offset, data)));
                    if resp.write_ready {
                        BankResult::Written
                    } else {
                        BankResult::Dropped
                    }
                }
            })
            .collect()
    }

    pub fn invalidate(&mut self, bank: BankId) {
        debug!("bank {} contents invalidated", bank);
        if let Some(store) = self.base.state.banks.get_mut(bank) {
            store.invalidate();
        }
    }

    pub fn bank(&self, bank: BankId) -> Option<&BankStore> {
        self.base.state.banks.get(bank)
    }

    pub fn bank_mut(&mut self, bank: BankId) -> Option<&mut BankStore> {
        self.base.state.banks.get_mut(bank)
    }
}
