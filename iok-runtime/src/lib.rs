//! Runtime-side event primitives.
//!
//! Cooperative threads park on a `Waiter` until one of the `Trigger`s armed
//! on it fires. Sockets expose their triggers through an `EventSource`.

pub mod poll;
pub mod source;

pub use poll::{EventMask, MAX_AT_ONCE, PollError, PollOutcome, Trigger, TriggerState, Waiter};
pub use source::EventSource;
