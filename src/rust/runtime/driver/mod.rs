// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Event-driver boundary.
//!
//! The scheduler reaches timers, cross-thread signals and the blocking wait for new events only through
//! [EventDriver]. A driver instance is confined to the thread that runs its event loop; the only objects that may
//! cross threads are the [DriverSignal]s it hands out.

mod generic;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::generic::GenericDriver;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::Arc,
    task::Waker,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Driver-level timer identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TimerId(pub usize);

/// Callback invoked on the driver thread every time a timer fires.
pub type TimerCallback = Box<dyn FnMut(TimerId)>;

/// Why a call to [EventDriver::process_events] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// The timeout elapsed without any event.
    Timeout,
    /// At least one event was processed.
    Idle,
    /// Nothing is left that could ever produce an event.
    OutOfWaiters,
    /// An exit was requested.
    Exited,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Thread-safe broadcast primitive. Triggering it wakes the owning driver out of a blocking [EventDriver::process_events].
pub trait DriverSignal: Send + Sync {
    fn trigger(&self);
}

/// Contract that I/O backends satisfy to host a scheduler.
pub trait EventDriver {
    /// Creates a disarmed timer.
    fn create_timer(&self, callback: Option<TimerCallback>) -> TimerId;

    /// Arms (or re-arms) a timer to fire after `timeout`, and then every `timeout` if `periodic` is set.
    fn rearm_timer(&self, id: TimerId, timeout: Duration, periodic: bool);

    /// Disarms a timer. Waiters are woken and observe that the timer is no longer pending.
    fn stop_timer(&self, id: TimerId);

    /// Registers `waker` to be woken the next time the timer fires or is stopped. Returns false, without registering,
    /// if the timer is not pending.
    fn wait_timer(&self, id: TimerId, waker: &Waker) -> bool;

    fn is_timer_pending(&self, id: TimerId) -> bool;

    /// Number of times the timer has fired since it was created.
    fn timer_fire_count(&self, id: TimerId) -> u64;

    /// Destroys a timer.
    fn release_timer(&self, id: TimerId);

    /// Number of armed timers.
    fn pending_timer_count(&self) -> usize;

    /// Creates a thread-safe signal bound to this driver.
    fn create_manual_event(&self) -> Arc<dyn DriverSignal>;

    /// Processes pending events, blocking for at most `timeout` (forever if `None`) when there are none.
    fn process_events(&self, timeout: Option<Duration>) -> ExitReason;

    /// Makes the current or next blocking [EventDriver::process_events] return [ExitReason::Exited].
    fn exit_event_loop(&self);
}
