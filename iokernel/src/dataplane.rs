//! The dataplane loop.
//!
//! One `Dataplane` runs per polling core and owns every piece of dataplane
//! state, so nothing in here is shared or locked. The outside world talks
//! to it through a `DataplaneHandle`, whose commands are only looked at
//! when an iteration found no other work.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::{debug, info, warn};

use crate::cipher::CipherEngine;
use crate::commands::CommandBroker;
use crate::completion::{CompletionRouter, send_to_runtime};
use crate::config::{IokernelConfig, PageTableMode};
use crate::lrpc::{ProtocolError, RX_NET_RECV};
use crate::mbuf::{MbufId, MbufPool};
use crate::nic::NicPort;
use crate::proc::{PollSet, ProcessId, ProcessSpec, ProcessTable, RuntimeProcess};
use crate::stats::{RateLimit, Stats, StatsReporter};
use crate::tx::TxPipeline;

/// Control-plane requests.
pub enum DataplaneCommand {
    /// Attach a runtime and start polling all of its threads.
    Attach(ProcessSpec),
    /// Tear a runtime down. In-flight work drains on its own.
    Kill(ProcessId),
    PollThread { id: ProcessId, thread: usize },
    UnpollThread { id: ProcessId, thread: usize },
    Shutdown,
}

impl std::fmt::Debug for DataplaneCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(spec) => write!(f, "Attach({})", spec.id),
            Self::Kill(id) => write!(f, "Kill({id})"),
            Self::PollThread { id, thread } => write!(f, "PollThread({id}/{thread})"),
            Self::UnpollThread { id, thread } => write!(f, "UnpollThread({id}/{thread})"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Handle for controlling a dataplane from another thread.
#[derive(Debug, Clone)]
pub struct DataplaneHandle {
    command_tx: Sender<DataplaneCommand>,
}

impl DataplaneHandle {
    pub fn attach(&self, spec: ProcessSpec) {
        self.send_command(DataplaneCommand::Attach(spec));
    }

    pub fn kill(&self, id: ProcessId) {
        self.send_command(DataplaneCommand::Kill(id));
    }

    pub fn poll_thread(&self, id: ProcessId, thread: usize) {
        self.send_command(DataplaneCommand::PollThread { id, thread });
    }

    pub fn unpoll_thread(&self, id: ProcessId, thread: usize) {
        self.send_command(DataplaneCommand::UnpollThread { id, thread });
    }

    pub fn shutdown(&self) {
        self.send_command(DataplaneCommand::Shutdown);
    }

    fn send_command(&self, cmd: DataplaneCommand) {
        if self.command_tx.send(cmd).is_err() {
            warn!("dataplane is gone, dropping command");
        }
    }
}

/// Create a command channel for a dataplane.
pub fn control_channel() -> (DataplaneHandle, Receiver<DataplaneCommand>) {
    let (command_tx, command_rx) = unbounded();
    (DataplaneHandle { command_tx }, command_rx)
}

/// Ingress packet source, drained at the top of every iteration.
pub trait Ingress {
    /// Returns true if any packet was handled.
    fn rx_burst(&mut self, procs: &ProcessTable, pool: &mut MbufPool) -> bool;
}

/// Core scheduling hook, invoked once per iteration.
pub trait Scheduler {
    /// Returns true if the scheduler did any work.
    fn sched_poll(&mut self, procs: &ProcessTable, polled: &mut PollSet) -> bool;
}

/// No ingress traffic.
impl Ingress for () {
    fn rx_burst(&mut self, _procs: &ProcessTable, _pool: &mut MbufPool) -> bool {
        false
    }
}

/// No scheduling decisions.
impl Scheduler for () {
    fn sched_poll(&mut self, _procs: &ProcessTable, _polled: &mut PollSet) -> bool {
        false
    }
}

/// Lend the ingress packet in `id` to `proc` and tell one of its threads.
/// The mbuf comes back with `TXCMD_NET_COMPLETE`. Frees it and returns
/// false when no thread had room.
pub fn deliver_ingress(proc: &RuntimeProcess, pool: &mut MbufPool, id: MbufId) -> bool {
    pool.lend(id, proc.id());
    if send_to_runtime(proc, RX_NET_RECV, u64::from(id.0)) {
        return true;
    }
    pool.free(id);
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Continue,
    Shutdown,
}

pub struct Dataplane<N: NicPort> {
    config: IokernelConfig,
    procs: ProcessTable,
    polled: PollSet,
    pool: MbufPool,
    nic: N,
    tx: TxPipeline,
    commands: CommandBroker,
    router: CompletionRouter,
    stats: Stats,
    reporter: StatsReporter,
    ingress: Box<dyn Ingress>,
    scheduler: Box<dyn Scheduler>,
    command_rx: Receiver<DataplaneCommand>,
    violation_log: RateLimit,
}

impl<N: NicPort> Dataplane<N> {
    pub fn new(
        config: IokernelConfig,
        nic: N,
        cipher: Box<dyn CipherEngine>,
        command_rx: Receiver<DataplaneCommand>,
    ) -> Self {
        Self {
            procs: ProcessTable::new(),
            polled: PollSet::new(),
            pool: MbufPool::new(config.mbuf_pool_size),
            nic,
            tx: TxPipeline::new(cipher, config.max_inflight_per_process),
            commands: CommandBroker::new(),
            router: CompletionRouter::new(),
            stats: Stats::default(),
            reporter: StatsReporter::new(config.stats_interval_ms),
            ingress: Box::new(()),
            scheduler: Box::new(()),
            command_rx,
            violation_log: RateLimit::default(),
            config,
        }
    }

    pub fn with_ingress(mut self, ingress: Box<dyn Ingress>) -> Self {
        self.ingress = ingress;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn procs(&self) -> &ProcessTable {
        &self.procs
    }

    pub fn polled(&self) -> &PollSet {
        &self.polled
    }

    pub fn pool(&self) -> &MbufPool {
        &self.pool
    }

    pub fn nic(&self) -> &N {
        &self.nic
    }

    pub fn nic_mut(&mut self) -> &mut N {
        &mut self.nic
    }

    pub fn tx(&self) -> &TxPipeline {
        &self.tx
    }

    /// Run until shut down.
    pub fn run(mut self) {
        info!(
            tx_burst = self.config.tx_burst_size,
            cmd_burst = self.config.cmd_burst_size,
            pool = self.config.mbuf_pool_size,
            "dataplane running"
        );
        while self.run_once() == LoopStatus::Continue {}
        info!(procs = self.procs.len(), "dataplane stopped");
    }

    /// One pass over every source of work.
    pub fn run_once(&mut self) -> LoopStatus {
        self.stats.loop_iterations += 1;
        let mut work = false;

        work |= self.ingress.rx_burst(&self.procs, &mut self.pool);
        work |= self.scheduler.sched_poll(&self.procs, &mut self.polled);

        work |= self.router.drain_overflow(
            &self.procs,
            self.config.overflow_batch_drain,
            &mut self.stats,
        ) > 0;

        work |= self.tx.reap(
            &mut self.pool,
            &mut self.nic,
            &mut self.router,
            &mut self.stats,
        ) > 0;

        let tx = self.tx.burst(
            &self.polled,
            &mut self.pool,
            &mut self.nic,
            &mut self.router,
            self.config.tx_burst_size,
            &mut self.stats,
        );
        work |= tx.work;
        for (id, thread) in tx.idle {
            // The runtime gets a wakeup through the scheduler instead.
            self.polled.unpoll(id, thread);
        }
        for (id, err) in tx.violations {
            self.kill_for_violation(id, err);
        }

        let cmds = self.commands.drain(
            &self.polled,
            &mut self.pool,
            &mut self.router,
            self.config.cmd_burst_size,
            &mut self.stats,
        );
        work |= cmds.pulled > 0;
        for (id, err) in cmds.violations {
            self.kill_for_violation(id, err);
        }

        self.reporter.maybe_report(&self.stats);

        if work {
            return LoopStatus::Continue;
        }
        self.poll_control()
    }

    fn poll_control(&mut self) -> LoopStatus {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => {
                    if self.handle_command(cmd) == LoopStatus::Shutdown {
                        return LoopStatus::Shutdown;
                    }
                }
                Err(TryRecvError::Empty) => return LoopStatus::Continue,
                Err(TryRecvError::Disconnected) => {
                    info!("control channel closed");
                    return LoopStatus::Shutdown;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: DataplaneCommand) -> LoopStatus {
        debug!(?cmd, "control command");
        match cmd {
            DataplaneCommand::Attach(mut spec) => {
                if let Err(reason) = self.admit(&mut spec) {
                    warn!(proc_id = %spec.id, %reason, "rejecting runtime");
                    return LoopStatus::Continue;
                }
                let proc = RuntimeProcess::new(spec, self.config.overflow_capacity);
                for thread in 0..proc.threads().len() {
                    self.polled.poll(&proc, thread);
                }
                self.procs.attach(proc);
            }
            DataplaneCommand::Kill(id) => self.kill(id),
            DataplaneCommand::PollThread { id, thread } => {
                match self.procs.get(id) {
                    Some(proc) if thread < proc.threads().len() => {
                        let proc = proc.clone();
                        self.polled.poll(&proc, thread);
                    }
                    _ => warn!(proc_id = %id, thread, "poll request for unknown thread"),
                }
            }
            DataplaneCommand::UnpollThread { id, thread } => self.polled.unpoll(id, thread),
            DataplaneCommand::Shutdown => {
                info!("shutdown requested");
                return LoopStatus::Shutdown;
            }
        }
        LoopStatus::Continue
    }

    /// Check a new runtime against the configured limits and build its
    /// page table.
    fn admit(&self, spec: &mut ProcessSpec) -> Result<(), String> {
        if self.procs.get(spec.id).is_some() {
            return Err("process already attached".into());
        }
        let min = self.config.completion_channel_capacity;
        if let Some((thread, t)) = spec
            .threads
            .iter()
            .enumerate()
            .find(|(_, t)| t.rxq.capacity() < min)
        {
            return Err(format!(
                "thread {thread} completion channel holds {}, need {min}",
                t.rxq.capacity()
            ));
        }
        if self.config.page_table == PageTableMode::Pagemap {
            spec.region
                .load_pagemap()
                .map_err(|e| format!("page table: {e}"))?;
        }
        Ok(())
    }

    fn kill(&mut self, id: ProcessId) {
        self.polled.unpoll_process(id);
        if self.procs.kill(id).is_none() {
            debug!(proc_id = %id, "kill for unknown process");
        }
    }

    fn kill_for_violation(&mut self, id: ProcessId, err: ProtocolError) {
        self.stats.protocol_violations += 1;
        if self.procs.get(id).is_none() {
            // Already killed earlier in this iteration.
            return;
        }
        if let Some(suppressed) = self.violation_log.check() {
            warn!(proc_id = %id, error = %err, suppressed, "protocol violation, killing runtime");
        }
        self.kill(id);
    }
}

impl<N: NicPort> std::fmt::Debug for Dataplane<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataplane")
            .field("procs", &self.procs.len())
            .field("polled", &self.polled.len())
            .field("pool", &self.pool)
            .field("tx", &self.tx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ChaChaCiphers;
    use crate::lrpc::{self, TXCMD_NET_COMPLETE};
    use crate::nic::LoopbackPort;
    use crate::proc::ThreadSpec;
    use crate::shm::ShmRegion;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn dataplane() -> (Dataplane<LoopbackPort>, DataplaneHandle) {
        let (handle, rx) = control_channel();
        let config = IokernelConfig {
            mbuf_pool_size: 64,
            stats_interval_ms: 0,
            completion_channel_capacity: 8,
            ..Default::default()
        };
        let dp = Dataplane::new(config, LoopbackPort::new(64), Box::new(ChaChaCiphers::new()), rx);
        (dp, handle)
    }

    fn spec(id: ProcessId) -> (ProcessSpec, lrpc::LrpcSender, lrpc::LrpcReceiver) {
        spec_with_capacity(id, 8)
    }

    fn spec_with_capacity(
        id: ProcessId,
        rx_cap: usize,
    ) -> (ProcessSpec, lrpc::LrpcSender, lrpc::LrpcReceiver) {
        let (_pkt_tx, pkt_rx) = lrpc::channel(8);
        let (cmd_tx, cmd_rx) = lrpc::channel(8);
        let (rx_tx, rx_rx) = lrpc::channel(rx_cap);
        let spec = ProcessSpec {
            id,
            region: ShmRegion::anonymous(4096).unwrap(),
            threads: vec![ThreadSpec {
                txpktq: pkt_rx,
                txcmdq: cmd_rx,
                rxq: rx_tx,
                active: Arc::new(AtomicBool::new(true)),
            }],
        };
        (spec, cmd_tx, rx_rx)
    }

    #[test]
    fn test_attach_kill_shutdown() {
        let (mut dp, handle) = dataplane();
        let id = ProcessId::new();
        let (s, _cmd, _rx) = spec(id);

        handle.attach(s);
        assert_eq!(dp.run_once(), LoopStatus::Continue);
        assert_eq!(dp.procs().len(), 1);
        assert_eq!(dp.polled().len(), 1);

        handle.unpoll_thread(id, 0);
        dp.run_once();
        assert!(dp.polled().is_empty());
        handle.poll_thread(id, 0);
        dp.run_once();
        assert_eq!(dp.polled().len(), 1);

        handle.kill(id);
        dp.run_once();
        assert!(dp.procs().is_empty());
        assert!(dp.polled().is_empty());

        handle.shutdown();
        assert_eq!(dp.run_once(), LoopStatus::Shutdown);
    }

    #[test]
    fn test_violation_kills_only_offender() {
        let (mut dp, handle) = dataplane();
        let bad = ProcessId::new();
        let good = ProcessId::new();
        let (s1, bad_cmd, _r1) = spec(bad);
        let (s2, _good_cmd, _r2) = spec(good);
        handle.attach(s1);
        handle.attach(s2);
        dp.run_once();

        bad_cmd.send(1234, 0);
        dp.run_once();
        assert!(dp.procs().get(bad).is_none());
        assert!(dp.procs().get(good).is_some());
        assert_eq!(dp.stats().protocol_violations, 1);
    }

    #[test]
    fn test_ingress_lending_roundtrip() {
        let (mut dp, handle) = dataplane();
        let id = ProcessId::new();
        let (s, cmd, rx) = spec(id);
        handle.attach(s);
        dp.run_once();

        let proc = dp.procs().get(id).unwrap().clone();
        let mbuf = dp.pool.alloc().unwrap();
        assert!(deliver_ingress(&proc, &mut dp.pool, mbuf));
        let msg = rx.recv().unwrap();
        assert_eq!((msg.cmd, msg.payload), (RX_NET_RECV, u64::from(mbuf.0)));

        cmd.send(TXCMD_NET_COMPLETE, msg.payload);
        dp.run_once();
        assert_eq!(dp.pool().available(), 64);
        assert_eq!(dp.stats().buffers_reclaimed, 1);
    }

    #[test]
    fn test_small_completion_channel_rejected() {
        let (mut dp, handle) = dataplane();
        let id = ProcessId::new();
        let (s, _cmd, _rx) = spec_with_capacity(id, 4);
        handle.attach(s);
        dp.run_once();
        assert!(dp.procs().is_empty());
        assert!(dp.polled().is_empty());

        // Duplicate ids are refused as well.
        let (s, _cmd, _rx) = spec(id);
        let (dup, _cmd2, _rx2) = spec(id);
        handle.attach(s);
        handle.attach(dup);
        dp.run_once();
        assert_eq!(dp.procs().len(), 1);
        assert_eq!(dp.polled().len(), 1);
    }

    /// Lends `left` ingress packets to the first attached process, one per
    /// call.
    struct Ingest {
        left: usize,
    }

    impl Ingress for Ingest {
        fn rx_burst(&mut self, procs: &ProcessTable, pool: &mut MbufPool) -> bool {
            let Some(proc) = procs.iter().next() else {
                return false;
            };
            if self.left == 0 {
                return false;
            }
            let Some(id) = pool.alloc() else {
                return false;
            };
            self.left -= 1;
            deliver_ingress(proc, pool, id)
        }
    }

    /// Keeps every thread of every process polled.
    struct PollEverything;

    impl Scheduler for PollEverything {
        fn sched_poll(&mut self, procs: &ProcessTable, polled: &mut PollSet) -> bool {
            let before = polled.len();
            for proc in procs.iter() {
                for thread in 0..proc.threads().len() {
                    polled.poll(proc, thread);
                }
            }
            polled.len() != before
        }
    }

    #[test]
    fn test_ingress_and_scheduler_hooks() {
        let (dp, handle) = dataplane();
        let mut dp = dp
            .with_ingress(Box::new(Ingest { left: 1 }))
            .with_scheduler(Box::new(PollEverything));
        let id = ProcessId::new();
        let (s, cmd, rx) = spec(id);
        handle.attach(s);
        dp.run_once();
        dp.run_once();

        let msg = rx.recv().unwrap();
        assert_eq!(msg.cmd, RX_NET_RECV);
        assert!(rx.recv().is_none());
        cmd.send(TXCMD_NET_COMPLETE, msg.payload);
        dp.run_once();
        assert_eq!(dp.stats().buffers_reclaimed, 1);
        assert_eq!(dp.pool().available(), 64);

        // The scheduler re-polls what the control plane unpolled.
        handle.unpoll_thread(id, 0);
        dp.run_once();
        assert!(dp.polled().is_empty());
        dp.run_once();
        assert_eq!(dp.polled().len(), 1);
    }

    #[test]
    fn test_disconnected_control_shuts_down() {
        let (mut dp, handle) = dataplane();
        drop(handle);
        assert_eq!(dp.run_once(), LoopStatus::Shutdown);
    }
}
