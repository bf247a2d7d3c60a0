//! Runtime processes and their polling threads.
//!
//! A process is shared through `Rc<RuntimeProcess>`. Every place that keeps
//! a process alive past the current call (the process table, a polled
//! thread entry, an in-flight mbuf, a submitted buffer awaiting its
//! completion) holds its own clone and drops it on its terminal event. The
//! shared memory mapping goes away when the last clone does.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::lrpc::{LrpcReceiver, LrpcSender, RX_NET_COMPLETE};
use crate::shm::ShmRegion;

/// Identifier of an attached runtime process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel endpoints for one runtime thread, as handed over at attach.
pub struct ThreadSpec {
    /// Packets to transmit (runtime -> iokernel).
    pub txpktq: LrpcReceiver,
    /// Commands (runtime -> iokernel).
    pub txcmdq: LrpcReceiver,
    /// Completions and ingress packets (iokernel -> runtime).
    pub rxq: LrpcSender,
    /// Set by the runtime while the thread is running.
    pub active: Arc<AtomicBool>,
}

/// Everything needed to attach a runtime. Built by the control plane on
/// another thread and sent to the dataplane.
pub struct ProcessSpec {
    pub id: ProcessId,
    pub region: ShmRegion,
    pub threads: Vec<ThreadSpec>,
}

/// One polling endpoint of a runtime process.
pub struct RuntimeThread {
    index: usize,
    pub(crate) txpktq: LrpcReceiver,
    pub(crate) txcmdq: LrpcReceiver,
    rxq: LrpcSender,
    active: Arc<AtomicBool>,
    polled: Cell<bool>,
}

impl RuntimeThread {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the runtime currently has this thread running.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the thread is in the dataplane's polled set.
    pub fn is_polled(&self) -> bool {
        self.polled.get()
    }

    /// Push a message onto the thread's completion queue.
    #[inline]
    pub fn send(&self, cmd: u64, payload: u64) -> bool {
        self.rxq.send(cmd, payload)
    }

    pub fn send_completion(&self, token: u64) -> bool {
        self.send(RX_NET_COMPLETE, token)
    }

    /// Messages the runtime has not picked up yet.
    pub fn completions_queued(&self) -> usize {
        self.rxq.len()
    }
}

/// An attached runtime.
pub struct RuntimeProcess {
    id: ProcessId,
    region: ShmRegion,
    threads: Vec<RuntimeThread>,
    overflow: RefCell<VecDeque<u64>>,
    overflow_capacity: usize,
    next_thread_rr: Cell<usize>,
    /// Pulled packets with a token whose completion is not delivered yet.
    tx_inflight: Cell<usize>,
    killed: Cell<bool>,
}

impl RuntimeProcess {
    pub fn new(spec: ProcessSpec, overflow_capacity: usize) -> Rc<Self> {
        let threads = spec
            .threads
            .into_iter()
            .enumerate()
            .map(|(index, t)| RuntimeThread {
                index,
                txpktq: t.txpktq,
                txcmdq: t.txcmdq,
                rxq: t.rxq,
                active: t.active,
                polled: Cell::new(false),
            })
            .collect();

        Rc::new(Self {
            id: spec.id,
            region: spec.region,
            threads,
            overflow: RefCell::new(VecDeque::with_capacity(overflow_capacity)),
            overflow_capacity,
            next_thread_rr: Cell::new(0),
            tx_inflight: Cell::new(0),
            killed: Cell::new(false),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    pub fn threads(&self) -> &[RuntimeThread] {
        &self.threads
    }

    pub fn thread(&self, index: usize) -> &RuntimeThread {
        &self.threads[index]
    }

    pub fn is_killed(&self) -> bool {
        self.killed.get()
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.set(true);
    }

    /// Advance the completion round-robin cursor, returning the old value.
    pub(crate) fn next_thread_rr(&self) -> usize {
        let rr = self.next_thread_rr.get();
        self.next_thread_rr.set(rr.wrapping_add(1));
        rr
    }

    /// Completions owed to or not yet consumed by the runtime.
    pub fn outstanding(&self) -> usize {
        let queued: usize = self.threads.iter().map(RuntimeThread::completions_queued).sum();
        self.tx_inflight.get() + self.overflow_len() + queued
    }

    pub fn tx_inflight(&self) -> usize {
        self.tx_inflight.get()
    }

    /// Count a pulled packet that will produce a completion.
    pub(crate) fn track_tx(&self, token: u64) {
        if token != 0 {
            self.tx_inflight.set(self.tx_inflight.get() + 1);
        }
    }

    /// The packet tagged `token` reached its terminal event.
    pub(crate) fn release_tx(&self, token: u64) {
        if token != 0 {
            self.tx_inflight.set(self.tx_inflight.get().saturating_sub(1));
        }
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.borrow().len()
    }

    /// Queue a token that could not be delivered. Returns false when full.
    pub(crate) fn push_overflow(&self, token: u64) -> bool {
        let mut q = self.overflow.borrow_mut();
        if q.len() >= self.overflow_capacity {
            return false;
        }
        q.push_back(token);
        true
    }

    pub(crate) fn pop_overflow(&self) -> Option<u64> {
        self.overflow.borrow_mut().pop_front()
    }

    /// Put back a token whose retry failed, keeping it oldest.
    pub(crate) fn unpop_overflow(&self, token: u64) {
        self.overflow.borrow_mut().push_front(token);
    }
}

impl fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("id", &self.id)
            .field("threads", &self.threads.len())
            .field("overflow", &self.overflow_len())
            .field("tx_inflight", &self.tx_inflight.get())
            .field("killed", &self.killed.get())
            .finish()
    }
}

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        info!(proc_id = %self.id, "runtime process released");
    }
}

/// A reference to one thread of a process. Holding it keeps the process
/// alive.
#[derive(Clone)]
pub struct ThreadRef {
    pub proc: Rc<RuntimeProcess>,
    pub index: usize,
}

impl ThreadRef {
    pub fn thread(&self) -> &RuntimeThread {
        self.proc.thread(self.index)
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proc.id(), self.index)
    }
}

/// Attached processes, in attach order.
#[derive(Default)]
pub struct ProcessTable {
    procs: Vec<Rc<RuntimeProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, proc: Rc<RuntimeProcess>) {
        info!(
            proc_id = %proc.id(),
            threads = proc.threads().len(),
            region_len = proc.region().len(),
            "runtime process attached"
        );
        self.procs.push(proc);
    }

    /// Mark a process killed and drop the table's reference. The process
    /// itself lives on until every in-flight reference is gone.
    pub fn kill(&mut self, id: ProcessId) -> Option<Rc<RuntimeProcess>> {
        let pos = self.procs.iter().position(|p| p.id() == id)?;
        let proc = self.procs.remove(pos);
        proc.mark_killed();
        info!(
            proc_id = %id,
            refs = Rc::strong_count(&proc) - 1,
            "runtime process killed"
        );
        Some(proc)
    }

    pub fn get(&self, id: ProcessId) -> Option<&Rc<RuntimeProcess>> {
        self.procs.iter().find(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<RuntimeProcess>> {
        self.procs.iter()
    }

    pub(crate) fn at(&self, index: usize) -> &Rc<RuntimeProcess> {
        &self.procs[index]
    }
}

/// Threads the dataplane drains, shared by the TX and command paths.
#[derive(Default)]
pub struct PollSet {
    threads: Vec<ThreadRef>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&mut self, proc: &Rc<RuntimeProcess>, index: usize) {
        let thread = proc.thread(index);
        if thread.polled.replace(true) {
            return;
        }
        debug!(proc_id = %proc.id(), thread = index, "polling thread");
        self.threads.push(ThreadRef {
            proc: Rc::clone(proc),
            index,
        });
    }

    pub fn unpoll(&mut self, id: ProcessId, index: usize) {
        if let Some(pos) = self
            .threads
            .iter()
            .position(|t| t.proc.id() == id && t.index == index)
        {
            let t = self.threads.remove(pos);
            t.thread().polled.set(false);
            debug!(proc_id = %id, thread = index, "unpolled thread");
        }
    }

    /// Drop every thread belonging to `id`.
    pub fn unpoll_process(&mut self, id: ProcessId) {
        self.threads.retain(|t| {
            if t.proc.id() == id {
                t.thread().polled.set(false);
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, index: usize) -> &ThreadRef {
        &self.threads[index]
    }
}
