//! Hardware descriptor pool.
//!
//! Mbufs carry no data room of their own: for transmit their data pointer
//! is redirected into the owning runtime's shared memory, and for receive
//! they are lent to a runtime until it hands them back. Descriptors are
//! addressed by `MbufId` so they can cross the channels as plain words.

use bitflags::bitflags;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::proc::{ProcessId, RuntimeProcess};

/// Offload flags a runtime sets in `tx_net_hdr.olflags`.
pub const OLFLAG_IP_CHKSUM: u16 = 0x1;
pub const OLFLAG_TCP_CHKSUM: u16 = 0x2;
pub const OLFLAG_IPV4: u16 = 0x4;
pub const OLFLAG_IPV6: u16 = 0x8;

bitflags! {
    /// Descriptor offload requests understood by the NIC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxOffload: u64 {
        const TCP_CKSUM = 1 << 52;
        const IP_CKSUM = 1 << 54;
        const IPV4 = 1 << 55;
        const IPV6 = 1 << 56;
    }
}

impl TxOffload {
    /// Translate runtime offload flags into descriptor bits.
    pub fn from_olflags(olflags: u16) -> Self {
        let mut flags = TxOffload::empty();
        if olflags & OLFLAG_IP_CHKSUM != 0 {
            flags |= TxOffload::IP_CKSUM;
        }
        if olflags & OLFLAG_TCP_CHKSUM != 0 {
            flags |= TxOffload::TCP_CKSUM;
        }
        if olflags & OLFLAG_IPV4 != 0 {
            flags |= TxOffload::IPV4;
        }
        if olflags & OLFLAG_IPV6 != 0 {
            flags |= TxOffload::IPV6;
        }
        flags
    }
}

/// Index of a descriptor in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MbufId(pub u32);

impl fmt::Display for MbufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbuf#{}", self.0)
    }
}

/// Completion routing attached to a transmit descriptor.
pub struct TxPriv {
    pub proc: Rc<RuntimeProcess>,
    pub thread: usize,
    pub completion_data: u64,
}

impl fmt::Debug for TxPriv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPriv")
            .field("proc", &self.proc.id())
            .field("thread", &self.thread)
            .field("completion_data", &self.completion_data)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Mbuf {
    buf_addr: Option<NonNull<u8>>,
    pub buf_iova: u64,
    pub data_len: u16,
    pub ol_flags: TxOffload,
    pub l2_len: u8,
    pub l3_len: u8,
    pub l4_len: u8,
    pub(crate) priv_data: Option<TxPriv>,
}

impl Mbuf {
    /// Redirect the data pointer at `len` bytes of the owner's region.
    ///
    /// The owning process must be stored in `priv_data` before the mbuf is
    /// handed to the NIC; that reference keeps the mapping alive.
    pub(crate) fn attach(&mut self, addr: NonNull<u8>, iova: u64, len: u16) {
        self.buf_addr = Some(addr);
        self.buf_iova = iova;
        self.data_len = len;
    }

    /// The bytes the NIC would put on the wire.
    pub fn data(&self) -> &[u8] {
        match (self.buf_addr, &self.priv_data) {
            // Safety: the process in `priv_data` keeps the region mapped,
            // and the range was bounds-checked in `attach`'s caller.
            (Some(addr), Some(_)) => unsafe {
                std::slice::from_raw_parts(addr.as_ptr(), self.data_len as usize)
            },
            _ => &[],
        }
    }

    pub fn completion_data(&self) -> u64 {
        self.priv_data.as_ref().map_or(0, |p| p.completion_data)
    }

    fn reset(&mut self) -> Option<TxPriv> {
        self.buf_addr = None;
        self.buf_iova = 0;
        self.data_len = 0;
        self.ol_flags = TxOffload::empty();
        self.l2_len = 0;
        self.l3_len = 0;
        self.l4_len = 0;
        self.priv_data.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUse,
    Lent(ProcessId),
}

/// Fixed-size descriptor pool.
pub struct MbufPool {
    mbufs: Vec<Mbuf>,
    state: Vec<SlotState>,
    free: Vec<MbufId>,
}

impl MbufPool {
    pub fn new(size: usize) -> Self {
        let mut mbufs = Vec::with_capacity(size);
        mbufs.resize_with(size, Mbuf::default);
        // Hand out low ids first.
        let free = (0..size as u32).rev().map(MbufId).collect();
        Self {
            mbufs,
            state: vec![SlotState::Free; size],
            free,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mbufs.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Allocate exactly `n` descriptors or none at all.
    pub fn alloc_bulk(&mut self, n: usize, out: &mut Vec<MbufId>) -> bool {
        if self.free.len() < n {
            return false;
        }
        let start = self.free.len() - n;
        for id in self.free.drain(start..).rev() {
            self.state[id.0 as usize] = SlotState::InUse;
            out.push(id);
        }
        true
    }

    pub fn alloc(&mut self) -> Option<MbufId> {
        let id = self.free.pop()?;
        self.state[id.0 as usize] = SlotState::InUse;
        Some(id)
    }

    /// Return a descriptor, handing back its completion routing if any.
    ///
    /// Panics on a double free: pool state is the dataplane's own and a
    /// double free means it is corrupt.
    pub fn free(&mut self, id: MbufId) -> Option<TxPriv> {
        let slot = id.0 as usize;
        assert!(
            self.state[slot] != SlotState::Free,
            "{id} freed twice"
        );
        self.state[slot] = SlotState::Free;
        self.free.push(id);
        self.mbufs[slot].reset()
    }

    /// Mark an in-use descriptor as lent to a runtime (ingress path).
    pub fn lend(&mut self, id: MbufId, to: ProcessId) {
        let slot = id.0 as usize;
        assert!(self.state[slot] == SlotState::InUse, "{id} is not allocated");
        self.state[slot] = SlotState::Lent(to);
    }

    pub fn is_lent_to(&self, id: MbufId, proc: ProcessId) -> bool {
        self.state
            .get(id.0 as usize)
            .is_some_and(|s| *s == SlotState::Lent(proc))
    }

    /// Take back a descriptor a runtime finished with. Returns false when
    /// the id was not lent to `proc`.
    pub fn reclaim(&mut self, id: MbufId, proc: ProcessId) -> bool {
        if !self.is_lent_to(id, proc) {
            return false;
        }
        self.free(id);
        true
    }

    pub fn get(&self, id: MbufId) -> &Mbuf {
        &self.mbufs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: MbufId) -> &mut Mbuf {
        &mut self.mbufs[id.0 as usize]
    }
}

impl fmt::Debug for MbufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MbufPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
