//! Edge-triggered event dispatch for cooperative threads.
//!
//! A `Waiter` collects fired `Trigger`s in FIFO order. Its owning thread
//! either blocks for the next one (`wait`) or runs their callbacks in
//! bounded batches (`callback_once`). Triggers may be fired from any
//! thread.
//!
//! Triggers are edge triggered: once its callback has run a trigger goes
//! back to `Armed` and only fires again on a new event, so callbacks must
//! drain their source completely.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

/// Callbacks run per `callback_once` call. Whatever is left stays queued.
pub const MAX_AT_ONCE: usize = 100;

bitflags! {
    /// Event kinds a trigger listens for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u16 {
        const TIMEOUT = 0x01;
        const READ = 0x02;
        const WRITE = 0x04;
        const SIGNAL = 0x08;
        const PERSIST = 0x10;
        const ET = 0x20;
    }
}

impl EventMask {
    /// Modifier bits that never match an event on their own.
    pub const MODIFIERS: Self = Self::PERSIST.union(Self::ET);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("trigger is already armed")]
    AlreadyArmed,

    #[error("trigger is not armed")]
    NotArmed,
}

pub type Result<T> = std::result::Result<T, PollError>;

/// Result of a non-blocking callback pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No trigger is armed on the waiter; nothing can ever fire.
    NoneArmed,
    /// Triggers are armed but none has fired.
    NoneFired,
    /// Ran this many callbacks.
    Processed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Unarmed,
    Armed,
    /// Fired and waiting in its waiter's queue.
    Queued,
}

type Callback = Box<dyn FnMut() + Send>;

static NEXT_TRIGGER_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    waiter: Weak<WaiterInner>,
    state: TriggerState,
    events: EventMask,
    data: u64,
    callback: Option<Callback>,
    /// Bumped on every arm and disarm, so a callback returning from a run
    /// can tell whether its registration is still the current one.
    generation: u64,
}

struct TriggerInner {
    id: u64,
    slot: Mutex<Slot>,
}

/// A single-shot-per-arm event registration. Clones refer to the same
/// trigger.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                id: NEXT_TRIGGER_ID.fetch_add(1, Ordering::Relaxed),
                slot: Mutex::new(Slot {
                    waiter: Weak::new(),
                    state: TriggerState::Unarmed,
                    events: EventMask::empty(),
                    data: 0,
                    callback: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TriggerState {
        self.inner.slot.lock().state
    }

    pub fn events(&self) -> EventMask {
        self.inner.slot.lock().events
    }

    pub fn data(&self) -> u64 {
        self.inner.slot.lock().data
    }

    /// Whether both handles refer to the same trigger.
    pub fn ptr_eq(&self, other: &Trigger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register with `waiter`. `Waiter::wait` hands `data` back when the
    /// trigger fires.
    pub fn arm(&self, waiter: &Waiter, data: u64) -> Result<()> {
        self.arm_inner(waiter, data, EventMask::empty(), None)
    }

    /// Register with `waiter` and run `callback` from `callback_once`
    /// whenever the trigger has fired.
    pub fn arm_with_callback<F>(&self, waiter: &Waiter, events: EventMask, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.arm_inner(waiter, 0, events, Some(Box::new(callback)))
    }

    fn arm_inner(
        &self,
        waiter: &Waiter,
        data: u64,
        events: EventMask,
        callback: Option<Callback>,
    ) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        if slot.state != TriggerState::Unarmed {
            return Err(PollError::AlreadyArmed);
        }
        slot.waiter = Arc::downgrade(&waiter.inner);
        slot.state = TriggerState::Armed;
        slot.events = events;
        slot.data = data;
        slot.callback = callback;
        slot.generation += 1;
        waiter.inner.queue.lock().armed += 1;
        trace!(trigger = self.inner.id, ?events, "armed");
        Ok(())
    }

    /// Unregister from the waiter, dropping a pending fire.
    pub fn disarm(&self) -> Result<()> {
        let callback = {
            let mut slot = self.inner.slot.lock();
            if slot.state == TriggerState::Unarmed {
                return Err(PollError::NotArmed);
            }
            if let Some(waiter) = slot.waiter.upgrade() {
                let mut q = waiter.queue.lock();
                if slot.state == TriggerState::Queued {
                    q.fired.retain(|t| !t.ptr_eq(self));
                }
                q.armed -= 1;
            }
            slot.state = TriggerState::Unarmed;
            slot.waiter = Weak::new();
            slot.events = EventMask::empty();
            slot.generation += 1;
            slot.callback.take()
        };
        // Dropped outside the lock; it may own other triggers.
        drop(callback);
        trace!(trigger = self.inner.id, "disarmed");
        Ok(())
    }

    /// Queue the trigger on its waiter and wake the waiter if it is
    /// blocked. Returns false when the trigger was not armed or had
    /// already fired.
    pub fn fire(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.state != TriggerState::Armed {
            return false;
        }
        let Some(waiter) = slot.waiter.upgrade() else {
            return false;
        };
        slot.state = TriggerState::Queued;
        waiter.queue.lock().fired.push_back(self.clone());
        drop(slot);

        // A full channel already holds a wake the waiter has not consumed.
        let _ = waiter.wake_tx.try_send(());
        trace!(trigger = self.inner.id, "fired");
        true
    }

    /// Move a popped trigger back to `Armed`, returning its data. `None`
    /// if it was disarmed after it was popped.
    fn take_fired(&self) -> Option<u64> {
        let mut slot = self.inner.slot.lock();
        if slot.state != TriggerState::Queued {
            return None;
        }
        slot.state = TriggerState::Armed;
        Some(slot.data)
    }

    /// Re-arm a popped trigger and run its callback. Returns false if it
    /// was disarmed in the meantime.
    fn run_callback(&self) -> bool {
        let (callback, generation) = {
            let mut slot = self.inner.slot.lock();
            if slot.state != TriggerState::Queued {
                return false;
            }
            slot.state = TriggerState::Armed;
            (slot.callback.take(), slot.generation)
        };

        // The slot is unlocked while the callback runs so it can fire,
        // disarm or re-arm its own trigger.
        if let Some(mut cb) = callback {
            cb();
            let mut slot = self.inner.slot.lock();
            if slot.generation == generation && slot.callback.is_none() {
                slot.callback = Some(cb);
            }
        }
        true
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Trigger")
            .field("id", &self.inner.id)
            .field("state", &slot.state)
            .field("events", &slot.events)
            .field("data", &slot.data)
            .finish()
    }
}

struct Queue {
    fired: VecDeque<Trigger>,
    armed: usize,
}

struct WaiterInner {
    queue: Mutex<Queue>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Collects fired triggers for one cooperative thread.
#[derive(Clone)]
pub struct Waiter {
    inner: Arc<WaiterInner>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            inner: Arc::new(WaiterInner {
                queue: Mutex::new(Queue {
                    fired: VecDeque::new(),
                    armed: 0,
                }),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Number of triggers currently armed here, fired or not.
    pub fn armed(&self) -> usize {
        self.inner.queue.lock().armed
    }

    /// Number of fired triggers waiting to be handled.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().fired.len()
    }

    fn pop(&self) -> Option<Trigger> {
        self.inner.queue.lock().fired.pop_front()
    }

    /// Park until the next wake. Wakes may be stale, so callers re-check
    /// the queue afterwards.
    fn park(&self) {
        // Both channel ends live in `inner`, so this only returns on a wake.
        let _ = self.inner.wake_rx.recv();
    }

    /// Block until a trigger fires and return the data it was armed with.
    /// The trigger is armed again on return.
    ///
    /// Only a fire ends the wait; there is no timeout or cancellation.
    pub fn wait(&self) -> u64 {
        loop {
            while let Some(t) = self.pop() {
                if let Some(data) = t.take_fired() {
                    return data;
                }
            }
            self.park();
        }
    }

    /// Block until at least one trigger has fired, then run callbacks as
    /// in `callback_once_nonblock`. Returns `NoneArmed` right away when
    /// nothing could ever fire.
    pub fn callback_once(&self) -> PollOutcome {
        loop {
            match self.callback_once_nonblock() {
                PollOutcome::NoneFired => self.park(),
                outcome => return outcome,
            }
        }
    }

    /// Run the callbacks of fired triggers in the order they fired, at most
    /// `MAX_AT_ONCE`. Triggers that fire while the batch runs join it.
    pub fn callback_once_nonblock(&self) -> PollOutcome {
        let mut n = 0;
        while n < MAX_AT_ONCE {
            let Some(t) = self.pop() else {
                break;
            };
            if t.run_callback() {
                n += 1;
            }
        }

        if n > 0 {
            trace!(processed = n, remaining = self.pending(), "ran callbacks");
            return PollOutcome::Processed(n);
        }
        if self.armed() == 0 {
            PollOutcome::NoneArmed
        } else {
            PollOutcome::NoneFired
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.inner.queue.lock();
        f.debug_struct("Waiter")
            .field("armed", &q.armed)
            .field("pending", &q.fired.len())
            .finish()
    }
}
