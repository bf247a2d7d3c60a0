//! iokernel: a userspace dataplane that multiplexes one NIC across many
//! runtime processes.
//!
//! Runtimes share a memory region and a set of lock-free channels with the
//! iokernel. The dataplane loop drains their transmit and command queues,
//! points NIC descriptors straight at their buffers, segments encrypted
//! datagrams in place, and routes completions back without ever blocking.

pub mod cipher;
pub mod commands;
pub mod completion;
pub mod config;
pub mod dataplane;
pub mod lrpc;
pub mod mbuf;
pub mod nic;
pub mod proc;
pub mod segment;
pub mod shm;
pub mod stats;
pub mod tx;

pub use config::IokernelConfig;
pub use dataplane::{Dataplane, DataplaneHandle, LoopStatus, control_channel};
