use std::collections::HashMap;

use log::debug;

use crate::base::mem::ExternalMemory;
use crate::sim::config::ExtMemConfig;
use crate::tilebuf::types::{Addr, RequesterId, Word};
use crate::timeq::{Cycle, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Read(Addr),
    Write(Addr, Word),
}

// a sparse word memory that initializes anything read with 0, answering each requester after
// a fixed latency
#[derive(Debug, Default)]
pub struct LatencyMemory {
    mem: HashMap<Addr, Word>,
    base_latency: Cycle,
    pending: HashMap<RequesterId, (PendingOp, Ticket)>,
    reads: u64,
    writes: u64,
}

impl LatencyMemory {
    pub fn new(config: &ExtMemConfig) -> Self {
        Self {
            base_latency: config.base_latency,
            ..Self::default()
        }
    }

    /// Backdoor accessors used to seed and check the tier outside of simulated time.
    pub fn peek(&self, addr: Addr) -> Word {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    pub fn poke(&mut self, addr: Addr, data: Word) {
        self.mem.insert(addr, data);
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn reset(&mut self) {
        self.mem.clear();
        self.pending.clear();
    }

    /// True once the access has waited out its latency. A different access from the same
    /// requester replaces the outstanding one.
    fn ready(&mut self, now: Cycle, requester: RequesterId, op: PendingOp) -> bool {
        if self.base_latency == 0 {
            return true;
        }
        match self.pending.get(&requester) {
            Some((pending, ticket)) if *pending == op => {
                if ticket.is_ready(now) {
                    self.pending.remove(&requester);
                    true
                } else {
                    false
                }
            }
            _ => {
                let ticket = Ticket::new(now, now + self.base_latency);
                debug!("ext mem: requester {} {:?} ready at {}", requester, op, ticket.ready_at());
                self.pending.insert(requester, (op, ticket));
                false
            }
        }
    }
}

impl ExternalMemory for LatencyMemory {
    fn read(&mut self, now: Cycle, requester: RequesterId, addr: Addr) -> Option<Word> {
        if !self.ready(now, requester, PendingOp::Read(addr)) {
            return None;
        }
        self.reads += 1;
        Some(self.peek(addr))
    }

    fn write(&mut self, now: Cycle, requester: RequesterId, addr: Addr, data: Word) -> bool {
        if !self.ready(now, requester, PendingOp::Write(addr, data)) {
            return false;
        }
        self.writes += 1;
        self.poke(addr, data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latency_answers_immediately() {
        let mut mem = LatencyMemory::new(&ExtMemConfig { base_latency: 0 });
        assert!(mem.write(0, 0, 0x100, 7));
        assert_eq!(Some(7), mem.read(0, 1, 0x100));
        assert_eq!(Some(0), mem.read(0, 1, 0x200));
    }

    #[test]
    fn latency_holds_until_ticket_ready() {
        let mut mem = LatencyMemory::new(&ExtMemConfig { base_latency: 3 });
        mem.poke(0x80, 42);
        assert_eq!(None, mem.read(10, 0, 0x80));
        assert_eq!(None, mem.read(12, 0, 0x80));
        assert_eq!(Some(42), mem.read(13, 0, 0x80));
        assert_eq!(1, mem.reads());
    }

    #[test]
    fn changed_access_restarts_latency() {
        let mut mem = LatencyMemory::new(&ExtMemConfig { base_latency: 2 });
        assert!(!mem.write(0, 0, 0x90, 1));
        assert!(!mem.write(1, 0, 0x90, 2));
        assert!(!mem.write(2, 0, 0x90, 2));
        assert!(mem.write(3, 0, 0x90, 2));
        assert_eq!(2, mem.peek(0x90));
    }
}
