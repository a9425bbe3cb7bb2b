/*
Fixed-latency holding queue.

A payload entering a `TimedServer` at cycle `t` comes out no earlier than `t + base_latency`,
in FIFO order. At most `queue_capacity` payloads wait at once; a full queue hands the payload
back so the caller keeps it and retries later.
*/

use std::collections::VecDeque;

use anyhow::ensure;
use serde::Deserialize;

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
}

impl Ticket {
    pub fn new(issued_at: Cycle, ready_at: Cycle) -> Self {
        Self { issued_at, ready_at }
    }

    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_latency: Cycle,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            queue_capacity: 1,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.queue_capacity > 0, "queue_capacity must be > 0");
        Ok(())
    }
}

/// Returned by a full queue; the caller still owns `payload`.
#[derive(Debug)]
pub struct Backpressure<T> {
    pub payload: T,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<(T, Ticket)>,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
        }
    }

    pub fn try_enqueue(&mut self, now: Cycle, payload: T) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure {
                payload,
                capacity: self.config.queue_capacity,
            });
        }
        let ticket = Ticket::new(now, now.saturating_add(self.config.base_latency));
        self.inflight.push_back((payload, ticket));
        Ok(ticket)
    }

    /// Oldest payload, once its latency has elapsed.
    pub fn pop_ready(&mut self, now: Cycle) -> Option<(T, Ticket)> {
        if self.inflight.front()?.1.is_ready(now) {
            self.inflight.pop_front()
        } else {
            None
        }
    }

    pub fn is_full(&self) -> bool {
        self.inflight.len() >= self.config.queue_capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
    }
}
