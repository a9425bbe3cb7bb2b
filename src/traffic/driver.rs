use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;

use crate::tilebuf::subsystem::{CycleInputs, CycleOutputs};
use crate::tilebuf::types::{Access, Addr, RequesterId, Word};
use crate::timeq::Cycle;
use crate::traffic::config::TrafficConfig;
use crate::traffic::logging::{PatternCheckpoint, TrafficLogger};
use crate::traffic::patterns::{PatternEngine, PatternOp};

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    access: Access,
    issued_at: Cycle,
}

#[derive(Debug, Clone, Default)]
struct RequesterCursor {
    pattern: usize,
    req_idx: u32,
    outstanding: Option<Outstanding>,
    done: bool,
    /// consecutive cycles the outstanding access lost arbitration
    wait_run: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    pub completed: u64,
    pub reads: u64,
    pub writes: u64,
    pub must_stalls: u64,
    pub conflicts: u64,
    pub data_mismatches: u64,
    pub total_latency: u64,
    pub max_latency: u64,
    /// per requester: longest continuous conflict wait
    pub max_wait: Vec<u64>,
}

impl TrafficStats {
    pub fn mean_latency(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.completed as f64
        }
    }
}

/// Drives one access per requester per cycle. A requester keeps re-presenting its outstanding
/// access until the tile buffer answers it, so retry state lives here and not in the buffer.
/// Completed writes update a shadow copy of memory that completed reads are checked against.
pub struct TrafficDriver {
    engine: PatternEngine,
    cursors: Vec<RequesterCursor>,
    shadow: HashMap<Addr, Word>,
    lockstep: bool,
    print_lines: bool,
    checkpoints: Vec<PatternCheckpoint>,
    stats: TrafficStats,
}

impl TrafficDriver {
    pub fn new(config: &TrafficConfig, engine: PatternEngine, num_requesters: usize) -> Self {
        Self {
            engine,
            cursors: vec![RequesterCursor::default(); num_requesters],
            shadow: HashMap::new(),
            lockstep: config.lockstep_patterns,
            print_lines: config.logging.print_traffic_lines,
            checkpoints: Vec::new(),
            stats: TrafficStats {
                max_wait: vec![0; num_requesters],
                ..TrafficStats::default()
            },
        }
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn checkpoints(&self) -> &[PatternCheckpoint] {
        &self.checkpoints
    }

    pub fn is_done(&self) -> bool {
        self.engine.is_empty() || self.cursors.iter().all(|c| c.done)
    }

    /// Record a word known to be in memory before traffic starts.
    pub fn seed(&mut self, addr: Addr, data: Word) {
        self.shadow.insert(addr, data);
    }

    pub fn expected(&self, addr: Addr) -> Option<Word> {
        self.shadow.get(&addr).copied()
    }

    /// Word written by `requester` for request `req_idx` of pattern `pattern`.
    pub fn write_data(requester: RequesterId, pattern: usize, req_idx: u32) -> Word {
        0x5700_0000_0000_0000 | ((requester as Word) << 40) | ((pattern as Word) << 24) | req_idx as Word
    }

    fn lockstep_pattern(&self) -> usize {
        self.cursors
            .iter()
            .filter(|c| !c.done)
            .map(|c| c.pattern)
            .min()
            .unwrap_or(0)
    }

    pub fn drive(&mut self, now: Cycle, inputs: &mut CycleInputs) {
        if self.engine.is_empty() {
            return;
        }
        let barrier = self.lockstep_pattern();
        for (requester, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.done {
                continue;
            }
            if cursor.outstanding.is_none() {
                if self.lockstep && cursor.pattern > barrier {
                    continue;
                }
                let Some(pattern) = self.engine.pattern(cursor.pattern) else {
                    cursor.done = true;
                    continue;
                };
                let Some(addr) = self.engine.addr(cursor.pattern, cursor.req_idx, requester) else {
                    cursor.done = true;
                    continue;
                };
                let access = match pattern.op {
                    PatternOp::Read => Access::Read { addr },
                    PatternOp::Write => Access::Write {
                        addr,
                        data: Self::write_data(requester, cursor.pattern, cursor.req_idx),
                    },
                };
                cursor.outstanding = Some(Outstanding {
                    access,
                    issued_at: now,
                });
            }
            if let (Some(slot), Some(outstanding)) =
                (inputs.consumers.get_mut(requester), cursor.outstanding)
            {
                *slot = Some(outstanding.access);
            }
        }
    }

    pub fn observe(&mut self, outputs: &CycleOutputs) {
        let now = outputs.cycle;
        let reqs_per_pattern = self.engine.reqs_per_pattern() as u32;
        for (requester, cursor) in self.cursors.iter_mut().enumerate() {
            let Some(outstanding) = cursor.outstanding else {
                continue;
            };
            let Some(resp) = outputs.consumers.get(requester) else {
                continue;
            };
            if resp.must_stall {
                self.stats.must_stalls += 1;
            }
            if resp.bank_conflict {
                self.stats.conflicts += 1;
                cursor.wait_run += 1;
                self.stats.max_wait[requester] = self.stats.max_wait[requester].max(cursor.wait_run);
            }
            if !resp.ready() {
                continue;
            }

            match outstanding.access {
                Access::Read { addr } => {
                    self.stats.reads += 1;
                    if let Some(expected) = self.shadow.get(&addr) {
                        if *expected != resp.read_data {
                            self.stats.data_mismatches += 1;
                            warn!(
                                "requester {} read {:#x}: got {:#x}, expected {:#x}",
                                requester, addr, resp.read_data, expected
                            );
                        }
                    }
                }
                Access::Write { addr, data } => {
                    self.stats.writes += 1;
                    self.shadow.insert(addr, data);
                }
            }

            let latency = now - outstanding.issued_at + 1;
            self.stats.completed += 1;
            self.stats.total_latency += latency;
            self.stats.max_latency = self.stats.max_latency.max(latency);
            cursor.outstanding = None;
            cursor.wait_run = 0;
            cursor.req_idx += 1;

            if cursor.req_idx >= reqs_per_pattern {
                let checkpoint = PatternCheckpoint {
                    requester,
                    pattern_name: self
                        .engine
                        .pattern_name(cursor.pattern)
                        .unwrap_or_default()
                        .to_string(),
                    finished_cycle: now,
                };
                debug!("requester {} finished pattern {}", requester, checkpoint.pattern_name);
                if self.print_lines {
                    TrafficLogger::log_pattern_checkpoint(&checkpoint);
                }
                self.checkpoints.push(checkpoint);
                cursor.pattern += 1;
                cursor.req_idx = 0;
                if cursor.pattern >= self.engine.len() {
                    cursor.done = true;
                    if self.print_lines {
                        TrafficLogger::log_requester_done(requester);
                    }
                }
            }
        }
    }
}
