use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::base::behavior::*;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::tilebuf::config::{PowerConfig, TileBufferConfig};
use crate::tilebuf::types::BankId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PowerState {
    #[default]
    Active,
    /// clock-gated, contents retained
    Idle,
    /// power-gated, contents lost
    Sleep,
}

impl Display for PowerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PowerState::Active => "active",
            PowerState::Idle => "idle",
            PowerState::Sleep => "sleep",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankPower {
    pub state: PowerState,
    pub idle_counter: u64,
    pub sleep_counter: u64,
    pub needs_reload: bool,
}

impl BankPower {
    pub fn enabled(&self) -> bool {
        self.state == PowerState::Active
    }

    fn enter(&mut self, state: PowerState) {
        self.state = state;
        self.idle_counter = 0;
        self.sleep_counter = 0;
        if state == PowerState::Sleep {
            self.needs_reload = true;
        }
    }
}

/// Per-bank inputs of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankPowerInputs {
    pub activity: bool,
    pub force_enable: bool,
    pub force_sleep: bool,
    /// the controller finished reloading this bank
    pub reload_done: bool,
}

/// Next-state function of one bank. `force_sleep` takes precedence over `force_enable`, which
/// in turn suppresses automatic decay.
pub fn next_power(bank: BankPower, inputs: BankPowerInputs, config: &PowerConfig) -> BankPower {
    let mut next = bank;
    if inputs.force_sleep {
        if next.state != PowerState::Sleep {
            next.enter(PowerState::Sleep);
        }
        next.needs_reload = true;
        return next;
    }

    if inputs.force_enable || !config.enabled {
        if next.state != PowerState::Active {
            next.enter(PowerState::Active);
        }
        next.idle_counter = 0;
    } else {
        match next.state {
            PowerState::Active if inputs.activity => next.idle_counter = 0,
            PowerState::Active => {
                next.idle_counter += 1;
                if next.idle_counter >= config.idle_cycles {
                    next.enter(PowerState::Idle);
                }
            }
            PowerState::Idle | PowerState::Sleep if inputs.activity => {
                next.enter(PowerState::Active)
            }
            PowerState::Idle => {
                next.sleep_counter += 1;
                if next.sleep_counter >= config.sleep_cycles {
                    next.enter(PowerState::Sleep);
                }
            }
            PowerState::Sleep => {}
        }
    }

    if inputs.reload_done && next.state != PowerState::Sleep {
        next.needs_reload = false;
    }
    next
}

/// Software overrides and reload acknowledgements, one bit per bank. Short vectors read as
/// all-zero for the missing banks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerControls {
    pub force_enable: Vec<bool>,
    pub force_sleep: Vec<bool>,
    pub reload_done: Vec<bool>,
}

impl PowerControls {
    fn bit(bits: &[bool], bank: BankId) -> bool {
        bits.get(bank).copied().unwrap_or(false)
    }

    pub fn for_bank(&self, bank: BankId, activity: bool) -> BankPowerInputs {
        BankPowerInputs {
            activity,
            force_enable: Self::bit(&self.force_enable, bank),
            force_sleep: Self::bit(&self.force_sleep, bank),
            reload_done: Self::bit(&self.reload_done, bank),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTransition {
    pub bank: BankId,
    pub from: PowerState,
    pub to: PowerState,
}

#[derive(Debug, Default)]
pub struct PowerManagerState {
    banks: Vec<BankPower>,
}

pub struct PowerManager {
    base: ModuleBase<PowerManagerState, TileBufferConfig>,
}

module!(PowerManager, PowerManagerState, TileBufferConfig,);

impl ModuleBehaviors for PowerManager {
    fn tick_one(&mut self) {
        self.base.cycle += 1;
    }

    fn reset(&mut self) {
        self.base.state.banks.fill(BankPower::default());
    }
}

impl PowerManager {
    pub fn new(config: Arc<TileBufferConfig>) -> Self {
        let mut me = PowerManager {
            base: ModuleBase::with_state(PowerManagerState {
                banks: vec![BankPower::default(); config.num_banks],
            }),
        };
        me.init_conf(config);
        me
    }

    pub fn bank(&self, bank: BankId) -> Option<BankPower> {
        self.base.state.banks.get(bank).copied()
    }

    pub fn states(&self) -> Vec<PowerState> {
        self.base.state.banks.iter().map(|b| b.state).collect()
    }

    pub fn enables(&self) -> Vec<bool> {
        self.base.state.banks.iter().map(BankPower::enabled).collect()
    }

    pub fn needs_reload(&self) -> Vec<bool> {
        self.base.state.banks.iter().map(|b| b.needs_reload).collect()
    }

    /// Advance every bank. `activity` is indexed by bank; `tiles_active` is ORed into every
    /// bank's activity.
    pub fn step(
        &mut self,
        activity: &[bool],
        tiles_active: bool,
        controls: &PowerControls,
    ) -> Vec<PowerTransition> {
        let config = self.conf().power;
        let mut transitions = Vec::new();
        for (bank, power) in self.base.state.banks.iter_mut().enumerate() {
            let active = tiles_active || activity.get(bank).copied().unwrap_or(false);
            let next = next_power(*power, controls.for_bank(bank, active), &config);
            if next.state != power.state {
                debug!("bank {} power {} -> {}", bank, power.state, next.state);
                transitions.push(PowerTransition {
                    bank,
                    from: power.state,
                    to: next.state,
                });
            }
            *power = next;
        }
        transitions
    }
}
