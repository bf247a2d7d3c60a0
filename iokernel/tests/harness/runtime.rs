//! Simulated runtime process
//!
//! Owns the runtime ends of the channels and a second mapping of the same
//! shared memory file the dataplane gets, so writes made here are what the
//! dataplane reads.

use std::fs::File;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use iokernel::commands::{BUF_HDR_LEN, BufHdr};
use iokernel::lrpc::{self, LrpcMsg, LrpcReceiver, LrpcSender, TXCMD_NET_BUF, TXPKT_NET_XMIT};
use iokernel::proc::{ProcessId, ProcessSpec, ThreadSpec};
use iokernel::segment::{TX_NET_HDR_LEN, TxNetHdr};
use iokernel::shm::ShmRegion;

pub struct TestThread {
    pub txpktq: LrpcSender,
    pub txcmdq: LrpcSender,
    pub rxq: LrpcReceiver,
    pub active: Arc<AtomicBool>,
}

pub struct TestRuntime {
    pub id: ProcessId,
    pub region: ShmRegion,
    pub threads: Vec<TestThread>,
    next_offset: usize,
    _file: File,
}

impl TestRuntime {
    /// Create a runtime and the spec the dataplane attaches.
    pub fn new(nthreads: usize, region_len: usize, chan_cap: usize) -> (Self, ProcessSpec) {
        let file = tempfile::tempfile().expect("Failed to create shm file");
        file.set_len(region_len as u64)
            .expect("Failed to size shm file");
        let region = ShmRegion::map_fd(file.as_fd(), region_len).expect("Failed to map shm");
        let theirs = ShmRegion::map_fd(file.as_fd(), region_len).expect("Failed to map shm");

        let mut threads = Vec::new();
        let mut specs = Vec::new();
        for _ in 0..nthreads {
            let (pkt_tx, pkt_rx) = lrpc::channel(chan_cap);
            let (cmd_tx, cmd_rx) = lrpc::channel(chan_cap);
            let (rx_tx, rx_rx) = lrpc::channel(chan_cap);
            let active = Arc::new(AtomicBool::new(true));
            specs.push(ThreadSpec {
                txpktq: pkt_rx,
                txcmdq: cmd_rx,
                rxq: rx_tx,
                active: Arc::clone(&active),
            });
            threads.push(TestThread {
                txpktq: pkt_tx,
                txcmdq: cmd_tx,
                rxq: rx_rx,
                active,
            });
        }

        let id = ProcessId::new();
        let spec = ProcessSpec {
            id,
            region: theirs,
            threads: specs,
        };
        let rt = Self {
            id,
            region,
            threads,
            next_offset: 0,
            _file: file,
        };
        (rt, spec)
    }

    /// Whether thread `thread`'s packet queue has no room left.
    pub fn pkt_queue_full(&self, thread: usize) -> bool {
        let q = &self.threads[thread].txpktq;
        q.len() == q.capacity()
    }

    /// Reserve `len` bytes of the region, 64-byte aligned.
    pub fn alloc(&mut self, len: usize) -> usize {
        let at = self.next_offset;
        self.next_offset = (at + len + 63) & !63;
        assert!(self.next_offset <= self.region.len(), "test region exhausted");
        at
    }

    /// Copy a complete buffer (starting with its `tx_net_hdr`) into the
    /// region and queue it for transmission on `thread`.
    pub fn xmit_raw(&mut self, thread: usize, buf: &[u8]) -> usize {
        let at = self.alloc(buf.len());
        self.region.write(at, buf).expect("write packet");
        assert!(
            self.threads[thread].txpktq.send(TXPKT_NET_XMIT, at as u64),
            "packet queue full"
        );
        at
    }

    /// Queue a plain frame with completion token `token`.
    pub fn xmit(&mut self, thread: usize, frame: &[u8], token: u64, olflags: u16) -> usize {
        let mut buf = vec![0u8; TX_NET_HDR_LEN + frame.len()];
        TxNetHdr {
            completion_data: token,
            len: frame.len() as u16,
            olflags,
            cipher: 0,
        }
        .emit(&mut buf);
        buf[TX_NET_HDR_LEN..].copy_from_slice(frame);
        self.xmit_raw(thread, &buf)
    }

    /// Hand a buffer back with `TXCMD_NET_BUF`.
    pub fn submit_buffer(&mut self, thread: usize, token: u64, data: &[u8]) -> usize {
        let at = self.alloc(BUF_HDR_LEN + data.len());
        let mut b = vec![0u8; BUF_HDR_LEN + data.len()];
        BufHdr {
            completion_data: token,
            len: data.len() as u32,
            flags: 0,
        }
        .emit(&mut b);
        b[BUF_HDR_LEN..].copy_from_slice(data);
        self.region.write(at, &b).expect("write buffer");
        assert!(self.threads[thread].txcmdq.send(TXCMD_NET_BUF, at as u64));
        at
    }

    pub fn send_command(&self, thread: usize, cmd: u64, payload: u64) -> bool {
        self.threads[thread].txcmdq.send(cmd, payload)
    }

    /// Everything waiting on `thread`'s completion queue.
    pub fn recv_all(&self, thread: usize) -> Vec<LrpcMsg> {
        std::iter::from_fn(|| self.threads[thread].rxq.recv()).collect()
    }

    /// Completion tokens from every thread, thread by thread.
    pub fn completions(&self) -> Vec<u64> {
        (0..self.threads.len())
            .flat_map(|t| self.recv_all(t))
            .filter(|m| m.cmd == lrpc::RX_NET_COMPLETE)
            .map(|m| m.payload)
            .collect()
    }

    pub fn set_active(&self, thread: usize, active: bool) {
        self.threads[thread].active.store(active, Ordering::Release);
    }

    /// Read back `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut b = vec![0u8; len];
        self.region.read(offset, &mut b).expect("read region");
        b
    }
}
