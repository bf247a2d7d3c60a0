//! NIC port abstraction.

use std::collections::VecDeque;
use tracing::trace;

use crate::mbuf::{MbufId, MbufPool};

/// The transmit side of a NIC queue.
pub trait NicPort {
    /// Queue descriptors for transmission. Returns how many were accepted,
    /// always a prefix of `ids`. Accepted descriptors belong to the port
    /// until `reap_completed` hands them back.
    fn tx_burst(&mut self, pool: &MbufPool, ids: &[MbufId]) -> usize;

    /// Append descriptors whose transmission finished.
    fn reap_completed(&mut self, out: &mut Vec<MbufId>);
}

/// A port that "transmits" by counting frames. Used to run the iokernel
/// without hardware.
#[derive(Debug)]
pub struct LoopbackPort {
    ring_size: usize,
    in_flight: VecDeque<MbufId>,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl LoopbackPort {
    pub fn new(ring_size: usize) -> Self {
        Self {
            ring_size,
            in_flight: VecDeque::with_capacity(ring_size),
            tx_packets: 0,
            tx_bytes: 0,
        }
    }
}

impl NicPort for LoopbackPort {
    fn tx_burst(&mut self, pool: &MbufPool, ids: &[MbufId]) -> usize {
        let room = self.ring_size - self.in_flight.len();
        let n = ids.len().min(room);
        for &id in &ids[..n] {
            let len = pool.get(id).data().len();
            trace!(%id, len, "loopback tx");
            self.tx_packets += 1;
            self.tx_bytes += len as u64;
            self.in_flight.push_back(id);
        }
        n
    }

    fn reap_completed(&mut self, out: &mut Vec<MbufId>) {
        out.extend(self.in_flight.drain(..));
    }
}
