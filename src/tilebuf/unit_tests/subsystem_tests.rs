use std::sync::Arc;

use crate::base::behavior::ModuleBehaviors;
use crate::sim::config::ExtMemConfig;
use crate::sim::ext_mem::LatencyMemory;
use crate::tilebuf::bank::POISON_WORD;
use crate::tilebuf::config::{PowerConfig, TileBufferConfig};
use crate::tilebuf::decoder::RegionConfig;
use crate::tilebuf::power::{PowerControls, PowerState};
use crate::tilebuf::subsystem::{grants_on_bank, CycleInputs, CycleOutputs, TileBuffer};
use crate::tilebuf::tile::{TileCommands, TileState};
use crate::tilebuf::types::{Access, ContractViolation, TileId};

fn buffer(config: TileBufferConfig) -> TileBuffer {
    TileBuffer::new(Arc::new(config)).expect("valid config")
}

fn idle(tb: &TileBuffer) -> CycleInputs {
    CycleInputs::idle(tb.config().num_requesters)
}

fn command(tb: &mut TileBuffer, ext: &mut LatencyMemory, commands: TileCommands) -> CycleOutputs {
    let mut inputs = idle(tb);
    inputs.commands = commands;
    tb.step(&inputs, ext)
}

fn make_ready(tb: &mut TileBuffer, ext: &mut LatencyMemory, tile: TileId) {
    command(
        tb,
        ext,
        TileCommands {
            load: Some(tile),
            ..TileCommands::default()
        },
    );
    let out = command(
        tb,
        ext,
        TileCommands {
            dma_write_done: true,
            ..TileCommands::default()
        },
    );
    assert_eq!(TileState::Ready, out.tile_states[tile]);
}

#[test]
fn rejects_invalid_geometry() {
    let res = TileBuffer::new(Arc::new(TileBufferConfig {
        num_banks: 6,
        ..TileBufferConfig::default()
    }));
    assert!(res.is_err());
}

#[test]
fn eight_requesters_on_eight_banks_all_proceed() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 0);
    for addr in 0..8 {
        tb.poke(addr, 0x100 + addr);
    }

    let mut inputs = idle(&tb);
    for r in 0..8 {
        inputs.consumers[r] = Some(Access::Read { addr: r as u64 });
    }
    let out = tb.step(&inputs, &mut ext);
    for r in 0..8 {
        assert!(out.consumers[r].read_ready, "requester {}", r);
        assert_eq!(0x100 + r as u64, out.consumers[r].read_data);
        assert!(!out.consumers[r].bank_conflict);
        assert_eq!(vec![r], grants_on_bank(&out, r));
    }
    assert_eq!(0, out.arbitration.num_conflicts());
    assert!(out.group_stall.iter().all(|&s| !s));
    assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8], tb.arbiter().pointers());
    assert_eq!(TileState::InUse, out.tile_states[0]);
}

#[test]
fn two_requesters_on_bank_zero_alternate() {
    let mut tb = buffer(TileBufferConfig {
        num_requesters: 2,
        requesters_per_group: 1,
        ..TileBufferConfig::default()
    });
    let mut ext = LatencyMemory::default();

    let mut winners = Vec::new();
    for cycle in 0..6u64 {
        let mut inputs = idle(&tb);
        inputs.consumers[0] = Some(Access::Write { addr: 0, data: cycle });
        inputs.consumers[1] = Some(Access::Write { addr: 8, data: cycle });
        let out = tb.step(&inputs, &mut ext);
        let winner = (0..2).find(|&r| out.consumers[r].write_ready).unwrap();
        let loser = 1 - winner;
        assert!(out.consumers[loser].bank_conflict);
        assert!(out.group_stall[loser]);
        assert!(!out.group_stall[winner]);
        winners.push(winner);
    }
    assert_eq!(vec![0, 1, 0, 1, 0, 1], winners);
    assert_eq!(1, tb.stats().max_wait());
    assert_eq!(6, tb.stats().total_conflicts());
}

#[test]
fn tile_lifecycle_gates_consumer_reads() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    tb.poke(4, 0xF00D);

    let read = |tb: &TileBuffer| {
        let mut inputs = idle(tb);
        inputs.consumers[2] = Some(Access::Read { addr: 4 });
        inputs
    };

    let out = tb.step(&read(&tb), &mut ext);
    assert!(out.consumers[2].must_stall);
    assert!(!out.consumers[2].read_ready);
    assert_eq!(None, out.arbitrated[2]);
    assert_eq!(
        vec![ContractViolation::ReadNotVisible {
            requester: 2,
            tile: 0,
            state: TileState::Idle
        }],
        out.violations
    );

    let mut inputs = read(&tb);
    inputs.commands.load = Some(0);
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[2].must_stall);
    assert_eq!(TileState::Loading, out.tile_states[0]);

    let mut inputs = read(&tb);
    inputs.commands.dma_write_done = true;
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[2].must_stall);
    assert_eq!(TileState::Ready, out.tile_states[0]);

    let out = tb.step(&read(&tb), &mut ext);
    assert!(out.consumers[2].read_ready);
    assert_eq!(0xF00D, out.consumers[2].read_data);
    assert_eq!(TileState::InUse, out.tile_states[0]);

    let fence = TileCommands {
        fence: Some(0),
        ..TileCommands::default()
    };
    let out = command(&mut tb, &mut ext, fence);
    assert!(!out.tile_fence_done);
    assert_eq!(TileState::Ready, out.tile_states[0]);
    let out = command(&mut tb, &mut ext, fence);
    assert!(out.tile_fence_done);

    let stats = tb.stats();
    assert_eq!(3, stats.requesters[2].must_stalls);
    assert_eq!(Some(&3), stats.violations.get("read_not_visible"));
    assert_eq!(1, stats.fences_done);
}

#[test]
fn writes_are_not_gated_by_tile_state() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 9, data: 99 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].write_ready);
    assert_eq!(Some(99), tb.peek(9));
    assert_eq!(TileState::Idle, out.tile_states[0]);
}

#[test]
fn non_resident_accesses_go_to_external_memory() {
    let mut tb = buffer(TileBufferConfig {
        region_base: 0x40,
        region_limit: 0xBF,
        ..TileBufferConfig::default()
    });
    let mut ext = LatencyMemory::new(&ExtMemConfig { base_latency: 2 });
    ext.poke(0x400, 0xABC);
    ext.poke(0x10, 0xDEF);

    let mut ready_at = None;
    for cycle in 0..4 {
        let mut inputs = idle(&tb);
        inputs.consumers[1] = Some(Access::Read { addr: 0x400 });
        let out = tb.step(&inputs, &mut ext);
        assert!(out.consumers[1].external);
        assert_eq!(None, out.arbitrated[1]);
        if out.consumers[1].read_ready {
            assert_eq!(0xABC, out.consumers[1].read_data);
            ready_at = Some(cycle);
            break;
        }
    }
    assert_eq!(Some(2), ready_at);

    // below base is routed outward as well
    let mut inputs = idle(&tb);
    inputs.consumers[3] = Some(Access::Read { addr: 0x10 });
    for _ in 0..3 {
        tb.step(&inputs, &mut ext);
    }
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[3].external);
    assert_eq!(1, tb.stats().requesters[1].external_reads);
    assert!(tb.stats().requesters[3].external_reads >= 1);
    assert_eq!(0, tb.stats().total_violations());
}

#[test]
fn region_write_takes_effect_next_cycle() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 0);

    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 0x100, data: 1 });
    inputs.config_write = Some(RegionConfig::new(0x100, 0x17F));
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].external);
    assert_eq!(RegionConfig::new(0x100, 0x17F), tb.region());

    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 0x100, data: 2 });
    let out = tb.step(&inputs, &mut ext);
    assert!(!out.consumers[0].external);
    assert!(out.consumers[0].write_ready);
    assert_eq!(Some(2), tb.peek(0x100));
    assert_eq!(Some((0x100, 0x11F)), tb.tile_range(0));
    assert_eq!(1, tb.stats().config_writes);
}

#[test]
fn malformed_region_write_turns_everything_external() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    let mut inputs = idle(&tb);
    inputs.config_write = Some(RegionConfig::new(0x80, 0x00));
    tb.step(&inputs, &mut ext);

    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 0x10, data: 5 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].external);
    assert!(out.consumers[0].write_ready);
    assert_eq!(5, ext.peek(0x10));
    assert_eq!(None, tb.tile_range(0));
}

#[test]
fn dma_port_follows_the_visibility_contract() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();

    // DMA write into an Idle tile is accepted
    let mut inputs = idle(&tb);
    inputs.dma = Some(Access::Write { addr: 40, data: 7 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.write_ready);
    assert!(!out.dma.rejected);

    // DMA read out of an Idle tile is refused
    let mut inputs = idle(&tb);
    inputs.dma = Some(Access::Read { addr: 40 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.rejected);
    assert!(!out.dma.read_ready);
    assert_eq!(None, out.arbitrated[tb.config().dma_slot()]);

    make_ready(&mut tb, &mut ext, 1);

    let mut inputs = idle(&tb);
    inputs.dma = Some(Access::Read { addr: 40 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.read_ready);
    assert_eq!(7, out.dma.read_data);
    // DMA reads do not count as a consumer's first read
    assert_eq!(TileState::Ready, out.tile_states[1]);

    let mut inputs = idle(&tb);
    inputs.dma = Some(Access::Write { addr: 40, data: 8 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.rejected);
    assert_eq!(Some(7), tb.peek(40));

    let mut inputs = idle(&tb);
    inputs.dma = Some(Access::Write { addr: 0x1000, data: 8 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.rejected);
    assert_eq!(vec![ContractViolation::DmaOutOfRegion { addr: 0x1000 }], out.violations);

    let stats = tb.stats();
    assert_eq!(3, stats.dma_rejects);
    assert_eq!(1, stats.dma_reads);
    assert_eq!(1, stats.dma_writes);
    assert_eq!(Some(&1), stats.violations.get("dma_write_not_idle"));
    assert_eq!(Some(&1), stats.violations.get("dma_read_not_ready"));
}

#[test]
fn dma_port_contends_like_a_requester_without_group_stall() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 0, data: 1 });
    inputs.dma = Some(Access::Write { addr: 8, data: 2 });

    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].write_ready);
    assert!(out.dma.bank_conflict);
    assert!(out.group_stall.iter().all(|&s| !s));

    let out = tb.step(&inputs, &mut ext);
    assert!(out.dma.write_ready);
    assert!(out.consumers[0].bank_conflict);
    assert!(out.group_stall[0]);
}

#[test]
fn store_in_the_same_cycle_as_first_read_wins() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 0);
    tb.poke(3, 33);

    let mut inputs = idle(&tb);
    inputs.consumers[5] = Some(Access::Read { addr: 3 });
    inputs.commands.store = Some(0);
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[5].read_ready);
    assert_eq!(33, out.consumers[5].read_data);
    assert_eq!(TileState::Evicting, out.tile_states[0]);
    assert!(out.violations.is_empty());

    let mut inputs = idle(&tb);
    inputs.consumers[5] = Some(Access::Read { addr: 3 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[5].must_stall);
}

#[test]
fn forced_sleep_drops_access_and_loses_data() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 0);
    tb.poke(1, 0x11);
    tb.poke(2, 0x22);

    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Read { addr: 1 });
    inputs.consumers[1] = Some(Access::Read { addr: 2 });
    inputs.power = PowerControls {
        force_sleep: vec![false, true],
        ..PowerControls::default()
    };
    let out = tb.step(&inputs, &mut ext);
    assert!(out.arbitration.granted[0]);
    assert!(!out.consumers[0].read_ready);
    assert!(!out.consumers[0].bank_conflict);
    assert!(out.consumers[1].read_ready);
    assert_eq!(0x22, out.consumers[1].read_data);
    assert_eq!(PowerState::Sleep, out.banks[1].power_state);
    assert!(!out.banks[1].active);
    assert!(out.banks[1].needs_reload);
    assert_eq!(Some(POISON_WORD), tb.peek(1));
    assert_eq!(1, tb.stats().requesters[0].gated_drops);
    assert_eq!(1, tb.stats().banks[1].dropped);
    // the dropped grant does not count as a turn
    assert_eq!(0, tb.arbiter().pointer(1));

    // released, the retry wakes the bank and reads what is left
    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Read { addr: 1 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].read_ready);
    assert_eq!(POISON_WORD, out.consumers[0].read_data);
    assert_eq!(PowerState::Active, out.banks[1].power_state);
    assert!(out.banks[1].needs_reload);

    let mut inputs = idle(&tb);
    inputs.power.reload_done = vec![false, true];
    let out = tb.step(&inputs, &mut ext);
    assert!(!out.banks[1].needs_reload);
}

#[test]
fn idle_banks_wake_for_the_access_that_reaches_them() {
    let mut tb = buffer(TileBufferConfig {
        power: PowerConfig {
            enabled: true,
            idle_cycles: 2,
            sleep_cycles: 100,
        },
        ..TileBufferConfig::default()
    });
    let mut ext = LatencyMemory::default();
    let quiet = idle(&tb);
    tb.step(&quiet, &mut ext);
    let out = tb.step(&quiet, &mut ext);
    assert!(out.banks.iter().all(|b| b.power_state == PowerState::Idle));

    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 3, data: 4 });
    let out = tb.step(&inputs, &mut ext);
    assert!(out.consumers[0].write_ready);
    assert_eq!(PowerState::Active, out.banks[3].power_state);
    assert_eq!(PowerState::Idle, out.banks[2].power_state);
    assert!(!out.banks[3].needs_reload);
    assert_eq!(Some(4), tb.peek(3));
}

#[test]
fn bank_three_decays_while_others_stay_busy() {
    let mut tb = buffer(TileBufferConfig {
        power: PowerConfig {
            enabled: true,
            idle_cycles: 3,
            sleep_cycles: 5,
        },
        ..TileBufferConfig::default()
    });
    let mut ext = LatencyMemory::default();
    let busy = |tb: &TileBuffer| {
        let mut inputs = idle(tb);
        for r in 0..8 {
            if r != 3 {
                inputs.consumers[r] = Some(Access::Write { addr: r as u64, data: 0 });
            }
        }
        inputs
    };

    let mut states = Vec::new();
    for _ in 0..9 {
        let out = tb.step(&busy(&tb), &mut ext);
        states.push((out.banks[3].power_state, out.banks[3].needs_reload));
        assert!(out.banks.iter().enumerate().all(|(b, s)| b == 3 || s.active));
    }
    assert_eq!((PowerState::Active, false), states[1]);
    assert_eq!((PowerState::Idle, false), states[2]);
    assert_eq!((PowerState::Idle, false), states[6]);
    assert_eq!((PowerState::Sleep, true), states[7]);
    assert_eq!(2, tb.stats().banks[3].power_transitions);
}

#[test]
fn undefined_tile_encoding_blocks_reads() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 0);
    tb.tiles_mut().load_encoding(0, 0xFF);
    assert_eq!(Some(TileState::Idle), tb.tile_state(0));
    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Read { addr: 0 });
    assert!(tb.step(&inputs, &mut ext).consumers[0].must_stall);
}

#[test]
fn reset_restores_control_state() {
    let mut tb = buffer(TileBufferConfig::default());
    let mut ext = LatencyMemory::default();
    make_ready(&mut tb, &mut ext, 2);
    let mut inputs = idle(&tb);
    inputs.consumers[0] = Some(Access::Write { addr: 0, data: 1 });
    inputs.config_write = Some(RegionConfig::new(0x200, 0x27F));
    tb.step(&inputs, &mut ext);

    tb.reset();
    assert_eq!(vec![TileState::Idle; 4], tb.tile_states());
    assert_eq!(RegionConfig::new(0x00, 0x7F), tb.region());
    assert!(tb.arbiter().pointers().iter().all(|&p| p == 0));
    // bank contents survive reset
    assert_eq!(Some(1), tb.peek(0));
}

#[test]
#[should_panic(expected = "contract violation")]
fn violations_panic_when_configured() {
    let mut tb = buffer(TileBufferConfig {
        panic_on_violation: true,
        ..TileBufferConfig::default()
    });
    let mut ext = LatencyMemory::default();
    command(
        &mut tb,
        &mut ext,
        TileCommands {
            store: Some(0),
            ..TileCommands::default()
        },
    );
}
