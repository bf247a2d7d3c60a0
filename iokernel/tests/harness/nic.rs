//! Scriptable NIC port

use std::collections::VecDeque;

use iokernel::mbuf::{MbufId, MbufPool, TxOffload};
use iokernel::nic::NicPort;

/// A frame as the NIC saw it when it was accepted.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub id: MbufId,
    pub data: Vec<u8>,
    pub completion_data: u64,
    pub ol_flags: TxOffload,
}

/// NIC whose per-burst acceptance can be scripted. Accepted frames stay in
/// flight until the test completes them.
#[derive(Debug, Default)]
pub struct MockNic {
    /// Acceptance limits for upcoming bursts; unlimited once exhausted.
    script: VecDeque<usize>,
    /// Every frame accepted so far, in acceptance order.
    pub sent: Vec<SentFrame>,
    /// Ids offered on every burst call, accepted or not.
    pub offered: Vec<Vec<MbufId>>,
    in_flight: VecDeque<MbufId>,
    completed: Vec<MbufId>,
    /// Hand back accepted frames on the next reap without being asked.
    pub auto_complete: bool,
}

impl MockNic {
    pub fn new() -> Self {
        Self {
            auto_complete: true,
            ..Default::default()
        }
    }

    /// A NIC that holds frames until `complete_all`.
    pub fn holding() -> Self {
        Self::default()
    }

    /// Accept at most `limit` frames on the next unscripted burst.
    pub fn accept_next(&mut self, limit: usize) -> &mut Self {
        self.script.push_back(limit);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Finish transmission of everything in flight.
    pub fn complete_all(&mut self) {
        self.completed.extend(self.in_flight.drain(..));
    }

    pub fn tokens(&self) -> Vec<u64> {
        self.sent.iter().map(|f| f.completion_data).collect()
    }
}

impl NicPort for MockNic {
    fn tx_burst(&mut self, pool: &MbufPool, ids: &[MbufId]) -> usize {
        self.offered.push(ids.to_vec());
        let limit = self.script.pop_front().unwrap_or(usize::MAX);
        let n = ids.len().min(limit);
        for &id in &ids[..n] {
            let m = pool.get(id);
            self.sent.push(SentFrame {
                id,
                data: m.data().to_vec(),
                completion_data: m.completion_data(),
                ol_flags: m.ol_flags,
            });
            self.in_flight.push_back(id);
        }
        n
    }

    fn reap_completed(&mut self, out: &mut Vec<MbufId>) {
        if self.auto_complete {
            self.complete_all();
        }
        out.append(&mut self.completed);
    }
}
