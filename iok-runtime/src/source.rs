//! Per-socket trigger lists.
//!
//! A socket keeps one `EventSource`. Application code arms triggers on it
//! for the event kinds it cares about, and the socket's receive and
//! transmit paths call `notify` when something happens.

use parking_lot::Mutex;
use tracing::trace;

use crate::poll::{EventMask, Result, Trigger, TriggerState, Waiter};

#[derive(Debug, Default)]
pub struct EventSource {
    triggers: Mutex<Vec<Trigger>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `trigger` on `waiter` and attach it to this source.
    pub fn arm<F>(&self, trigger: &Trigger, waiter: &Waiter, events: EventMask, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        trigger.arm_with_callback(waiter, events, callback)?;
        let mut triggers = self.triggers.lock();
        if !triggers.iter().any(|t| t.ptr_eq(trigger)) {
            triggers.push(trigger.clone());
        }
        Ok(())
    }

    /// Detach `trigger`. It stays armed on its waiter.
    pub fn remove(&self, trigger: &Trigger) -> bool {
        let mut triggers = self.triggers.lock();
        let before = triggers.len();
        triggers.retain(|t| !t.ptr_eq(trigger));
        triggers.len() != before
    }

    pub fn len(&self) -> usize {
        self.triggers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.lock().is_empty()
    }

    /// Fire every armed trigger listening for any of `events`. Triggers
    /// found disarmed are detached. Returns how many fired.
    pub fn notify(&self, events: EventMask) -> usize {
        let kinds = events.difference(EventMask::MODIFIERS);
        if kinds.is_empty() {
            return 0;
        }

        let matching: Vec<Trigger> = {
            let mut triggers = self.triggers.lock();
            triggers.retain(|t| t.state() != TriggerState::Unarmed);
            triggers
                .iter()
                .filter(|t| t.events().intersects(kinds))
                .cloned()
                .collect()
        };

        // Fired outside the list lock; a waiter's thread may be arming
        // triggers on this source concurrently.
        let fired = matching.iter().filter(|t| t.fire()).count();
        trace!(?events, fired, "notified");
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollOutcome;

    #[test]
    fn test_notify_matches_mask() {
        let w = Waiter::new();
        let src = EventSource::new();
        let reader = Trigger::new();
        let writer = Trigger::new();
        src.arm(&reader, &w, EventMask::READ | EventMask::ET, || {})
            .unwrap();
        src.arm(&writer, &w, EventMask::WRITE, || {}).unwrap();

        assert_eq!(src.notify(EventMask::READ), 1);
        assert_eq!(src.notify(EventMask::ET), 0);
        // Already queued.
        assert_eq!(src.notify(EventMask::READ | EventMask::WRITE), 1);
        assert_eq!(w.callback_once_nonblock(), PollOutcome::Processed(2));
    }

    #[test]
    fn test_disarmed_triggers_detached() {
        let w = Waiter::new();
        let src = EventSource::new();
        let t = Trigger::new();
        src.arm(&t, &w, EventMask::READ, || {}).unwrap();
        assert_eq!(src.len(), 1);

        t.disarm().unwrap();
        assert_eq!(src.notify(EventMask::READ), 0);
        assert!(src.is_empty());

        src.arm(&t, &w, EventMask::READ, || {}).unwrap();
        assert!(src.remove(&t));
        assert!(!src.remove(&t));
        assert_eq!(src.notify(EventMask::READ), 0);
    }
}
