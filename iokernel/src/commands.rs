//! Command queue processing.
//!
//! Runtimes use their command queue to hand buffers back and forth. Every
//! iteration drains at most `cmd_burst_size` commands across all polled
//! threads, starting from a position that advances on each call.

use std::rc::Rc;
use tracing::trace;

use crate::completion::CompletionRouter;
use crate::lrpc::{Command, ProtocolError};
use crate::mbuf::{MbufId, MbufPool};
use crate::proc::{PollSet, ProcessId, RuntimeProcess};
use crate::shm::ShmRegion;
use crate::stats::Stats;

/// Size of the `buf_hdr` at the start of a submitted buffer.
pub const BUF_HDR_LEN: usize = 16;

/// Header of a buffer submitted with `TXCMD_NET_BUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufHdr {
    pub completion_data: u64,
    pub len: u32,
    pub flags: u32,
}

impl BufHdr {
    pub fn parse(b: &[u8; BUF_HDR_LEN]) -> Self {
        let mut token = [0u8; 8];
        token.copy_from_slice(&b[0..8]);
        Self {
            completion_data: u64::from_le_bytes(token),
            len: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            flags: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        }
    }

    pub fn emit(&self, b: &mut [u8]) {
        b[0..8].copy_from_slice(&self.completion_data.to_le_bytes());
        b[8..12].copy_from_slice(&self.len.to_le_bytes());
        b[12..16].copy_from_slice(&self.flags.to_le_bytes());
    }

    /// Resolve and validate the header at `offset`. The whole buffer,
    /// header and data, must lie inside the region.
    pub fn resolve(region: &ShmRegion, offset: u64) -> Result<Self, ProtocolError> {
        let offset = usize::try_from(offset).map_err(|_| ProtocolError::MalformedDescriptor {
            offset: usize::MAX,
            reason: "offset does not fit the address space",
        })?;
        let mut b = [0u8; BUF_HDR_LEN];
        region.read(offset, &mut b)?;
        let hdr = Self::parse(&b);
        region.check(offset + BUF_HDR_LEN, hdr.len as usize)?;
        Ok(hdr)
    }
}

/// A submitted buffer awaiting its completion. Holds the process alive.
struct Submitted {
    proc: Rc<RuntimeProcess>,
    thread: usize,
    hdr: BufHdr,
}

/// Result of one drain pass.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub pulled: usize,
    /// Processes that broke the protocol; the caller ends their sessions.
    pub violations: Vec<(ProcessId, ProtocolError)>,
}

#[derive(Debug, Default)]
pub struct CommandBroker {
    pos: usize,
}

impl CommandBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(
        &mut self,
        polled: &PollSet,
        pool: &mut MbufPool,
        router: &mut CompletionRouter,
        max_batch: usize,
        stats: &mut Stats,
    ) -> DrainOutcome {
        let mut out = DrainOutcome::default();
        let mut submitted = Vec::new();
        let n = polled.len();

        for i in 0..n {
            if out.pulled >= max_batch {
                break;
            }
            let t = polled.get((self.pos + i) % n);
            if out.violations.iter().any(|(id, _)| *id == t.proc.id()) {
                continue;
            }

            let thread = t.thread();
            while out.pulled < max_batch {
                let Some(msg) = thread.txcmdq.recv() else {
                    break;
                };
                out.pulled += 1;

                let handled = Command::decode(msg).and_then(|cmd| match cmd {
                    Command::BufferReclaimed { mbuf } => {
                        let id = u32::try_from(mbuf)
                            .map(MbufId)
                            .map_err(|_| ProtocolError::BadMbuf { id: mbuf })?;
                        if !pool.reclaim(id, t.proc.id()) {
                            return Err(ProtocolError::BadMbuf { id: mbuf });
                        }
                        stats.buffers_reclaimed += 1;
                        Ok(())
                    }
                    Command::BufferSubmitted { offset } => {
                        let proc = Rc::clone(&t.proc);
                        let hdr = BufHdr::resolve(proc.region(), offset)?;
                        trace!(proc_id = %proc.id(), offset, len = hdr.len, "buffer submitted");
                        submitted.push(Submitted {
                            proc,
                            thread: t.index,
                            hdr,
                        });
                        stats.buffers_submitted += 1;
                        Ok(())
                    }
                    Command::TxCompleteAck { .. } => {
                        stats.tx_complete_acks += 1;
                        Ok(())
                    }
                });

                if let Err(e) = handled {
                    out.violations.push((t.proc.id(), e));
                    break;
                }
            }
        }
        self.pos = self.pos.wrapping_add(1);
        stats.commands_pulled += out.pulled as u64;

        // One delivery attempt per buffer; dropping the entry releases its
        // process reference.
        for s in submitted {
            router.deliver(&s.proc, s.thread, s.hdr.completion_data, stats);
        }

        out
    }
}
