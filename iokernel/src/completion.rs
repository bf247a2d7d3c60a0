//! Completion delivery and per-process overflow queues.

use tracing::{debug, warn};

use crate::lrpc::RX_NET_COMPLETE;
use crate::proc::{ProcessTable, RuntimeProcess};
use crate::stats::{RateLimit, Stats};

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed onto a completion channel.
    Sent,
    /// Channel full; parked in the process's overflow queue.
    Overflowed,
    /// Overflow queue full too; the token is lost.
    Dropped,
    /// Process already killed; nobody is listening.
    Killed,
    /// Token 0, nothing owed.
    NotOwed,
}

/// Push to some thread of `proc`, preferring an active one. Each call
/// advances the process's round-robin cursor.
pub fn send_to_runtime(proc: &RuntimeProcess, cmd: u64, payload: u64) -> bool {
    let n = proc.threads().len();
    if n == 0 {
        return false;
    }
    let start = proc.next_thread_rr();
    let target = (0..n)
        .map(|i| proc.thread((start + i) % n))
        .find(|t| t.is_active())
        .unwrap_or_else(|| proc.thread(start % n));
    target.send(cmd, payload)
}

/// Routes completion tokens back to runtimes.
#[derive(Debug, Default)]
pub struct CompletionRouter {
    drain_pos: usize,
    drop_log: RateLimit,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `token` for work submitted by `thread` of `proc`.
    pub fn deliver(
        &mut self,
        proc: &RuntimeProcess,
        thread: usize,
        token: u64,
        stats: &mut Stats,
    ) -> Delivery {
        if proc.is_killed() {
            return Delivery::Killed;
        }
        if token == 0 {
            return Delivery::NotOwed;
        }

        let t = proc.thread(thread);
        let sent = if t.is_active() {
            t.send_completion(token)
        } else {
            send_to_runtime(proc, RX_NET_COMPLETE, token)
        };
        if sent {
            stats.completions_sent += 1;
            return Delivery::Sent;
        }

        if proc.push_overflow(token) {
            stats.completions_overflowed += 1;
            debug!(proc_id = %proc.id(), thread, "completion overflowed");
            return Delivery::Overflowed;
        }

        stats.completions_dropped += 1;
        if let Some(suppressed) = self.drop_log.check() {
            warn!(
                proc_id = %proc.id(),
                suppressed,
                "completion overflow queue full, dropping completion"
            );
        }
        Delivery::Dropped
    }

    /// Retry overflowed completions, at most `max_batch` in total. Processes
    /// are visited round-robin from a cursor that advances every call.
    pub fn drain_overflow(
        &mut self,
        procs: &ProcessTable,
        max_batch: usize,
        stats: &mut Stats,
    ) -> usize {
        let n = procs.len();
        let mut drained = 0;
        for i in 0..n {
            if drained >= max_batch {
                break;
            }
            let proc = procs.at((self.drain_pos + i) % n);
            drained += Self::drain_one(proc, max_batch - drained);
        }
        self.drain_pos = self.drain_pos.wrapping_add(1);
        stats.completions_drained += drained as u64;
        drained
    }

    fn drain_one(proc: &RuntimeProcess, budget: usize) -> usize {
        let mut n = 0;
        while n < budget {
            let Some(token) = proc.pop_overflow() else {
                break;
            };
            if !send_to_runtime(proc, RX_NET_COMPLETE, token) {
                proc.unpop_overflow(token);
                break;
            }
            n += 1;
        }
        if n > 0 {
            debug!(proc_id = %proc.id(), drained = n, "drained overflow queue");
        }
        n
    }
}
