//! Transmit path (runtimes -> NIC).
//!
//! Each iteration pulls a burst of `tx_net_hdr`s from the polled threads,
//! segments the ones flagged for inline encryption, points one mbuf at
//! each resulting packet and submits the lot. Packets the NIC rejects stay
//! in `retained`, untouched, and go out first next time.
//!
//! A process stops being pulled from once it has `max_inflight` completions
//! outstanding, counting packets not yet completed, overflowed tokens and
//! messages still sitting in its completion channels.

use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, trace, warn};

use crate::cipher::CipherEngine;
use crate::completion::CompletionRouter;
use crate::lrpc::{ProtocolError, TXPKT_NET_XMIT};
use crate::mbuf::{MbufId, MbufPool, TxOffload, TxPriv};
use crate::nic::NicPort;
use crate::proc::{PollSet, ProcessId, ThreadRef};
use crate::segment::{self, SegmentError, TX_NET_HDR_LEN, TxNetHdr};
use crate::stats::{RateLimit, Stats};

const ETH_HDR_LEN: u8 = 14;
const IPV4_HDR_LEN: u8 = 20;
const TCP_HDR_LEN: u8 = 20;

/// A packet ready for a descriptor.
struct PendingTx {
    thread: ThreadRef,
    /// Region offset of the packet's `tx_net_hdr`.
    offset: usize,
    hdr: TxNetHdr,
}

/// Result of one TX iteration.
#[derive(Debug, Default)]
pub struct TxOutcome {
    /// Whether anything was pulled, prepared or sent.
    pub work: bool,
    /// Threads found inactive with an empty queue.
    pub idle: Vec<(ProcessId, usize)>,
    pub violations: Vec<(ProcessId, ProtocolError)>,
}

pub struct TxPipeline {
    cipher: Box<dyn CipherEngine>,
    pos: usize,
    /// Drained packets waiting for mbufs.
    staged: Vec<PendingTx>,
    /// Prepared descriptors the NIC has not accepted yet, oldest first.
    retained: VecDeque<MbufId>,
    reaped: Vec<MbufId>,
    max_inflight: usize,
    alloc_log: RateLimit,
    crypto_log: RateLimit,
    lost_log: RateLimit,
}

impl TxPipeline {
    pub fn new(cipher: Box<dyn CipherEngine>, max_inflight: usize) -> Self {
        Self {
            cipher,
            pos: 0,
            staged: Vec::new(),
            retained: VecDeque::new(),
            reaped: Vec::new(),
            max_inflight,
            alloc_log: RateLimit::default(),
            crypto_log: RateLimit::default(),
            lost_log: RateLimit::default(),
        }
    }

    /// Descriptors held back by a full NIC ring.
    pub fn retained(&self) -> impl Iterator<Item = MbufId> + '_ {
        self.retained.iter().copied()
    }

    /// Packets waiting for the mbuf pool to refill.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Run one TX iteration.
    pub fn burst<N: NicPort + ?Sized>(
        &mut self,
        polled: &PollSet,
        pool: &mut MbufPool,
        nic: &mut N,
        router: &mut CompletionRouter,
        burst_size: usize,
        stats: &mut Stats,
    ) -> TxOutcome {
        let mut out = TxOutcome::default();

        let budget = burst_size.saturating_sub(self.retained.len() + self.staged.len());
        let pulled = self.pull(polled, budget, &mut out);
        stats.tx_pulled += pulled.len() as u64;

        for pkt in pulled {
            self.expand(pkt, router, stats, &mut out);
        }

        if !self.staged.is_empty() && !self.prepare(pool, router, stats) {
            // Keep whatever the NIC still owes us moving.
            out.work |= self.submit(pool, nic, stats) > 0;
            return out;
        }

        out.work |= self.submit(pool, nic, stats) > 0;
        out
    }

    /// Round-robin pop of up to `budget` packets.
    fn pull(&mut self, polled: &PollSet, budget: usize, out: &mut TxOutcome) -> Vec<PendingTx> {
        let mut pulled = Vec::new();
        let n = polled.len();

        for i in 0..n {
            if pulled.len() >= budget {
                break;
            }
            let t = polled.get((self.pos + i) % n);
            let thread = t.thread();

            while pulled.len() < budget {
                if t.proc.outstanding() >= self.max_inflight {
                    trace!(proc_id = %t.proc.id(), "tx: in-flight limit reached");
                    break;
                }
                let Some(msg) = thread.txpktq.recv() else {
                    if !thread.is_active() {
                        out.idle.push((t.proc.id(), t.index));
                    }
                    break;
                };
                match resolve(t, msg.cmd, msg.payload) {
                    Ok(pkt) => {
                        t.proc.track_tx(pkt.hdr.completion_data);
                        pulled.push(pkt);
                    }
                    Err(e) => {
                        out.violations.push((t.proc.id(), e));
                        break;
                    }
                }
            }
        }
        self.pos = self.pos.wrapping_add(1);
        out.work |= !pulled.is_empty();
        pulled
    }

    /// Segment `pkt` if it asks for it and stage the result.
    fn expand(
        &mut self,
        pkt: PendingTx,
        router: &mut CompletionRouter,
        stats: &mut Stats,
        out: &mut TxOutcome,
    ) {
        if !pkt.hdr.needs_segmentation() {
            self.staged.push(pkt);
            return;
        }

        let region = pkt.thread.proc.region();
        let total = TX_NET_HDR_LEN + usize::from(pkt.hdr.len);
        // SAFETY: the runtime handed this buffer over with TXPKT_NET_XMIT and
        // does not touch it until the completion; `resolve` bounds-checked it.
        let result = unsafe { region.slice_mut(pkt.offset, total) }
            .map_err(ProtocolError::from)
            .map(|buf| segment::segment_in_place(buf, self.cipher.as_ref()));

        match result {
            Ok(Ok(offsets)) => {
                stats.segments += offsets.len() as u64;
                trace!(proc_id = %pkt.thread.proc.id(), segments = offsets.len(), "segmented");
                for rel in offsets {
                    let offset = pkt.offset + rel;
                    match read_hdr(region, offset) {
                        Ok(hdr) => self.staged.push(PendingTx {
                            thread: pkt.thread.clone(),
                            offset,
                            hdr,
                        }),
                        Err(e) => out.violations.push((pkt.thread.proc.id(), e)),
                    }
                }
            }
            Ok(Err(SegmentError::Crypto { chunk, source })) => {
                stats.crypto_drops += 1;
                if let Some(suppressed) = self.crypto_log.check() {
                    warn!(
                        proc_id = %pkt.thread.proc.id(),
                        chunk,
                        suppressed,
                        error = %source,
                        "tx: dropping packet after cipher failure"
                    );
                }
                // The runtime still gets its buffer back.
                pkt.thread.proc.release_tx(pkt.hdr.completion_data);
                router.deliver(
                    &pkt.thread.proc,
                    pkt.thread.index,
                    pkt.hdr.completion_data,
                    stats,
                );
            }
            Ok(Err(e)) => out.violations.push((
                pkt.thread.proc.id(),
                ProtocolError::MalformedDescriptor {
                    offset: pkt.offset,
                    reason: segment_reason(&e),
                },
            )),
            Err(e) => out.violations.push((pkt.thread.proc.id(), e)),
        }
    }

    /// Attach an mbuf to every staged packet. All or nothing.
    fn prepare(
        &mut self,
        pool: &mut MbufPool,
        router: &mut CompletionRouter,
        stats: &mut Stats,
    ) -> bool {
        let mut ids = Vec::with_capacity(self.staged.len());
        if !pool.alloc_bulk(self.staged.len(), &mut ids) {
            stats.tx_alloc_fail += 1;
            if let Some(suppressed) = self.alloc_log.check() {
                warn!(
                    wanted = self.staged.len(),
                    available = pool.available(),
                    suppressed,
                    "tx: error getting mbufs from pool"
                );
            }
            return false;
        }

        for (pkt, id) in self.staged.drain(..).zip(ids) {
            let region = pkt.thread.proc.region();
            let payload = pkt.offset + TX_NET_HDR_LEN;
            let len = pkt.hdr.len;
            // Both were validated in `resolve` and the region cannot shrink.
            let (Ok(addr), Ok(iova)) = (
                region.ptr_at(payload, usize::from(len)),
                region.iova(payload),
            ) else {
                pool.free(id);
                if let Some(suppressed) = self.lost_log.check() {
                    warn!(
                        proc_id = %pkt.thread.proc.id(),
                        offset = pkt.offset,
                        suppressed,
                        "tx: no io address for packet, dropping"
                    );
                }
                pkt.thread.proc.release_tx(pkt.hdr.completion_data);
                router.deliver(
                    &pkt.thread.proc,
                    pkt.thread.index,
                    pkt.hdr.completion_data,
                    stats,
                );
                continue;
            };

            let mbuf = pool.get_mut(id);
            mbuf.attach(addr, iova, len);
            if pkt.hdr.olflags != 0 {
                mbuf.ol_flags = TxOffload::from_olflags(pkt.hdr.olflags);
                mbuf.l2_len = ETH_HDR_LEN;
                mbuf.l3_len = IPV4_HDR_LEN;
                mbuf.l4_len = TCP_HDR_LEN;
            }
            mbuf.priv_data = Some(TxPriv {
                proc: Rc::clone(&pkt.thread.proc),
                thread: pkt.thread.index,
                completion_data: pkt.hdr.completion_data,
            });
            self.retained.push_back(id);
        }
        true
    }

    /// Hand retained descriptors to the NIC, oldest first.
    fn submit<N: NicPort + ?Sized>(&mut self, pool: &MbufPool, nic: &mut N, stats: &mut Stats) -> usize {
        if self.retained.is_empty() {
            return 0;
        }
        let ids = self.retained.make_contiguous();
        let sent = nic.tx_burst(pool, ids).min(ids.len());
        self.retained.drain(..sent);
        stats.tx_sent += sent as u64;
        debug!(sent, "tx: transmitted packets");

        if !self.retained.is_empty() {
            stats.tx_backpressure += self.retained.len() as u64;
            debug!(held = self.retained.len(), "tx: ring full, holding packets");
        }
        sent
    }

    /// Return finished descriptors to the pool and deliver their
    /// completions.
    pub fn reap<N: NicPort + ?Sized>(
        &mut self,
        pool: &mut MbufPool,
        nic: &mut N,
        router: &mut CompletionRouter,
        stats: &mut Stats,
    ) -> usize {
        nic.reap_completed(&mut self.reaped);
        let n = self.reaped.len();
        for id in self.reaped.drain(..) {
            if let Some(p) = pool.free(id) {
                p.proc.release_tx(p.completion_data);
                router.deliver(&p.proc, p.thread, p.completion_data, stats);
            }
        }
        n
    }
}

impl std::fmt::Debug for TxPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPipeline")
            .field("pos", &self.pos)
            .field("staged", &self.staged.len())
            .field("retained", &self.retained.len())
            .finish()
    }
}

fn read_hdr(region: &crate::shm::ShmRegion, offset: usize) -> Result<TxNetHdr, ProtocolError> {
    let mut b = [0u8; TX_NET_HDR_LEN];
    region.read(offset, &mut b)?;
    let hdr = TxNetHdr::parse(&b);
    region.check(offset, TX_NET_HDR_LEN + usize::from(hdr.len))?;
    Ok(hdr)
}

/// Validate one packet-queue message.
fn resolve(t: &ThreadRef, cmd: u64, payload: u64) -> Result<PendingTx, ProtocolError> {
    if cmd != TXPKT_NET_XMIT {
        return Err(ProtocolError::UnknownTxCommand { cmd });
    }
    let offset = usize::try_from(payload).map_err(|_| ProtocolError::MalformedDescriptor {
        offset: usize::MAX,
        reason: "offset does not fit the address space",
    })?;
    let hdr = read_hdr(t.proc.region(), offset)?;
    Ok(PendingTx {
        thread: t.clone(),
        offset,
        hdr,
    })
}

fn segment_reason(e: &SegmentError) -> &'static str {
    match e {
        SegmentError::TooShort { .. } => "too short to segment",
        SegmentError::BadUdpLength { .. } => "udp length does not match chunk layout",
        SegmentError::BadChunk { .. } => "bad chunk lengths",
        SegmentError::Crypto { .. } => "cipher failure",
    }
}
