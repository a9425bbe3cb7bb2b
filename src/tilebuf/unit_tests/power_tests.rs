use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tilebuf::config::{PowerConfig, TileBufferConfig};
use crate::tilebuf::power::{
    next_power, BankPower, BankPowerInputs, PowerControls, PowerManager, PowerState,
};

const IDLE: u64 = 4;
const SLEEP: u64 = 6;

fn manager(num_banks: usize) -> PowerManager {
    PowerManager::new(Arc::new(TileBufferConfig {
        num_banks,
        power: PowerConfig {
            enabled: true,
            idle_cycles: IDLE,
            sleep_cycles: SLEEP,
        },
        ..TileBufferConfig::default()
    }))
}

fn busy_except(num_banks: usize, idle_bank: usize) -> Vec<bool> {
    (0..num_banks).map(|b| b != idle_bank).collect()
}

#[test]
fn idle_bank_decays_to_sleep_and_needs_reload_after_wake() {
    let mut pm = manager(8);
    let controls = PowerControls::default();
    let activity = busy_except(8, 3);

    for _ in 0..IDLE - 1 {
        pm.step(&activity, false, &controls);
    }
    assert_eq!(PowerState::Active, pm.bank(3).unwrap().state);

    let transitions = pm.step(&activity, false, &controls);
    assert_eq!(1, transitions.len());
    assert_eq!((3, PowerState::Active, PowerState::Idle), (transitions[0].bank, transitions[0].from, transitions[0].to));
    let bank = pm.bank(3).unwrap();
    assert!(!bank.enabled());
    assert!(!bank.needs_reload);
    assert!(pm.enables().iter().enumerate().all(|(b, &e)| e == (b != 3)));

    for _ in 0..SLEEP - 1 {
        pm.step(&activity, false, &controls);
    }
    assert_eq!(PowerState::Idle, pm.bank(3).unwrap().state);
    pm.step(&activity, false, &controls);
    let bank = pm.bank(3).unwrap();
    assert_eq!(PowerState::Sleep, bank.state);
    assert!(bank.needs_reload);

    // stays asleep until touched
    for _ in 0..10 {
        pm.step(&activity, false, &controls);
    }
    assert_eq!(PowerState::Sleep, pm.bank(3).unwrap().state);

    pm.step(&[true; 8], false, &controls);
    let bank = pm.bank(3).unwrap();
    assert_eq!(PowerState::Active, bank.state);
    assert!(bank.needs_reload);
    assert_eq!(vec![false, false, false, true, false, false, false, false], pm.needs_reload());

    let reload = PowerControls {
        reload_done: vec![false, false, false, true],
        ..PowerControls::default()
    };
    pm.step(&[true; 8], false, &reload);
    assert!(!pm.bank(3).unwrap().needs_reload);
}

#[test]
fn activity_in_idle_wakes_without_data_loss() {
    let mut pm = manager(1);
    let controls = PowerControls::default();
    for _ in 0..IDLE {
        pm.step(&[false], false, &controls);
    }
    assert_eq!(PowerState::Idle, pm.bank(0).unwrap().state);
    let transitions = pm.step(&[true], false, &controls);
    assert_eq!(PowerState::Active, transitions[0].to);
    assert!(!pm.bank(0).unwrap().needs_reload);
}

#[test]
fn tile_activity_keeps_every_bank_awake() {
    let mut pm = manager(4);
    for _ in 0..(IDLE + SLEEP) * 2 {
        assert!(pm.step(&[false; 4], true, &PowerControls::default()).is_empty());
    }
    assert!(pm.states().iter().all(|&s| s == PowerState::Active));
}

#[test]
fn force_sleep_overrides_force_enable() {
    let mut pm = manager(2);
    let controls = PowerControls {
        force_enable: vec![true, true],
        force_sleep: vec![true, false],
        ..PowerControls::default()
    };
    pm.step(&[true, false], false, &controls);
    assert_eq!(vec![PowerState::Sleep, PowerState::Active], pm.states());
    assert!(pm.bank(0).unwrap().needs_reload);

    // force_enable alone holds the bank awake with no activity
    let hold = PowerControls {
        force_enable: vec![false, true],
        ..PowerControls::default()
    };
    for _ in 0..IDLE * 3 {
        pm.step(&[false, false], false, &hold);
    }
    assert_eq!(PowerState::Active, pm.bank(1).unwrap().state);
}

#[test]
fn reload_done_is_ignored_while_asleep() {
    let config = PowerConfig::default();
    let asleep = BankPower {
        state: PowerState::Sleep,
        needs_reload: true,
        ..BankPower::default()
    };
    let next = next_power(
        asleep,
        BankPowerInputs {
            reload_done: true,
            ..BankPowerInputs::default()
        },
        &config,
    );
    assert_eq!(PowerState::Sleep, next.state);
    assert!(next.needs_reload);

    // the access that wakes the bank can carry the acknowledgement
    let next = next_power(
        asleep,
        BankPowerInputs {
            activity: true,
            reload_done: true,
            ..BankPowerInputs::default()
        },
        &config,
    );
    assert_eq!(PowerState::Active, next.state);
    assert!(!next.needs_reload);
}

#[test]
fn disabled_power_management_holds_banks_active() {
    let config = PowerConfig {
        enabled: false,
        idle_cycles: 1,
        sleep_cycles: 1,
    };
    let mut bank = BankPower::default();
    for _ in 0..10 {
        bank = next_power(bank, BankPowerInputs::default(), &config);
    }
    assert_eq!(PowerState::Active, bank.state);
}

/// `needs_reload` holds exactly when the bank is asleep or has left sleep without a reload.
#[test]
fn needs_reload_tracks_data_loss_under_random_inputs() {
    let config = PowerConfig {
        enabled: true,
        idle_cycles: 2,
        sleep_cycles: 3,
    };
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bank = BankPower::default();
        let mut lost = false;
        for step in 0..400 {
            let inputs = BankPowerInputs {
                activity: rng.gen_bool(0.2),
                force_enable: rng.gen_bool(0.05),
                force_sleep: rng.gen_bool(0.03),
                reload_done: rng.gen_bool(0.1),
            };
            bank = next_power(bank, inputs, &config);
            let asleep = bank.state == PowerState::Sleep;
            lost = asleep || (lost && !inputs.reload_done);
            assert_eq!(lost, bank.needs_reload, "seed {} step {}: {:?}", seed, step, bank);
            assert_eq!(bank.enabled(), bank.state == PowerState::Active);
        }
    }
}
