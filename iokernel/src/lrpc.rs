//! Shared channels between runtime threads and the iokernel.
//!
//! Every runtime thread owns three bounded queues: a command queue and a
//! packet queue (runtime -> iokernel) and a completion queue (iokernel ->
//! runtime). Messages are `(cmd, payload)` word pairs; the payload is a
//! shared-memory offset, an mbuf id or a completion token depending on the
//! command. Both ends are non-blocking: a full queue makes `send` fail and
//! an empty queue makes `recv` return `None`.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::shm::ShmError;

/// Command queue: an RX mbuf the runtime is done with.
pub const TXCMD_NET_COMPLETE: u64 = 0;
/// Command queue: a buffer handed over to the iokernel.
pub const TXCMD_NET_BUF: u64 = 1;
/// Command queue: acknowledgement of a transmit completion (opaque).
pub const TXCMD_TX_COMPLETE_ACK: u64 = 2;

/// Packet queue: transmit the `tx_net_hdr` at the payload offset.
pub const TXPKT_NET_XMIT: u64 = 0;

/// Completion queue: an ingress packet for the runtime.
pub const RX_NET_RECV: u64 = 0;
/// Completion queue: the operation tagged with the payload token finished.
pub const RX_NET_COMPLETE: u64 = 1;

/// A runtime broke the channel protocol.
///
/// These errors end the offending runtime's session; they never stop the
/// iokernel itself.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command {cmd} (payload {payload:#x})")]
    UnknownCommand { cmd: u64, payload: u64 },

    #[error("unknown transmit command {cmd}")]
    UnknownTxCommand { cmd: u64 },

    #[error("mbuf {id} is not lent to this process")]
    BadMbuf { id: u64 },

    #[error("bad shared memory reference: {0}")]
    BadOffset(#[from] ShmError),

    #[error("descriptor at {offset:#x} is malformed: {reason}")]
    MalformedDescriptor { offset: usize, reason: &'static str },
}

/// A single channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrpcMsg {
    pub cmd: u64,
    pub payload: u64,
}

/// Decoded command-queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// An RX mbuf returned to the pool.
    BufferReclaimed { mbuf: u64 },
    /// A `buf_hdr` at this region offset is now owned by the iokernel.
    BufferSubmitted { offset: u64 },
    /// Acknowledgement; carried through without interpretation.
    TxCompleteAck { payload: u64 },
}

impl Command {
    /// Decode a raw message, rejecting unknown commands.
    pub fn decode(msg: LrpcMsg) -> Result<Self, ProtocolError> {
        match msg.cmd {
            TXCMD_NET_COMPLETE => Ok(Command::BufferReclaimed { mbuf: msg.payload }),
            TXCMD_NET_BUF => Ok(Command::BufferSubmitted {
                offset: msg.payload,
            }),
            TXCMD_TX_COMPLETE_ACK => Ok(Command::TxCompleteAck {
                payload: msg.payload,
            }),
            cmd => Err(ProtocolError::UnknownCommand {
                cmd,
                payload: msg.payload,
            }),
        }
    }
}

/// Create a bounded channel with room for `capacity` messages.
pub fn channel(capacity: usize) -> (LrpcSender, LrpcReceiver) {
    let queue = Arc::new(ArrayQueue::new(capacity));
    (
        LrpcSender {
            queue: Arc::clone(&queue),
        },
        LrpcReceiver { queue },
    )
}

/// Producing end. Intentionally not `Clone`: one producer per queue.
pub struct LrpcSender {
    queue: Arc<ArrayQueue<LrpcMsg>>,
}

impl LrpcSender {
    /// Try to enqueue a message. Returns false if the queue is full.
    #[inline]
    pub fn send(&self, cmd: u64, payload: u64) -> bool {
        self.queue.push(LrpcMsg { cmd, payload }).is_ok()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl fmt::Debug for LrpcSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LrpcSender")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

/// Consuming end. Intentionally not `Clone`: one consumer per queue.
pub struct LrpcReceiver {
    queue: Arc<ArrayQueue<LrpcMsg>>,
}

impl LrpcReceiver {
    /// Try to dequeue a message.
    #[inline]
    pub fn recv(&self) -> Option<LrpcMsg> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl fmt::Debug for LrpcReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LrpcReceiver")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}
