// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Broadcast event shared across tasks and threads.
//!
//! Waiters compare the emit counter against the value they captured earlier, so an emission that happens between
//! capturing the counter and suspending is never lost.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    check_interrupt,
    context::current_task_id,
    fail::Fail,
    scheduler::TaskId,
    timer::{
        sleep,
        UtilityMethods,
    },
};
use ::futures::FutureExt;
use ::parking_lot::Mutex;
use ::slab::Slab;
use ::std::{
    future::Future,
    pin::Pin,
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
    task::{
        Context,
        Poll,
        Waker,
    },
    thread::{
        self,
        ThreadId,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct EventWaiter {
    thread: ThreadId,
    task: Option<TaskId>,
    waker: Waker,
}

/// Manual-reset broadcast event.
pub struct ManualEvent {
    emit_count: AtomicU32,
    waiters: Mutex<Slab<EventWaiter>>,
}

/// Future that completes once the emit counter moves away from a reference value.
pub struct EventWait<'a> {
    event: &'a ManualEvent,
    ref_count: u32,
    interruptible: bool,
    /// Registration in the waiter registry, valid while the counter still equals `ref_count`.
    key: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ManualEvent {
    pub fn new() -> Self {
        Self {
            emit_count: AtomicU32::new(0),
            waiters: Mutex::new(Slab::new()),
        }
    }

    /// Number of emissions so far.
    pub fn emit_count(&self) -> u32 {
        self.emit_count.load(Ordering::Acquire)
    }

    /// Number of tasks currently suspended on this event.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Bumps the counter and wakes every current waiter. Returns the new counter.
    pub fn emit(&self) -> u32 {
        let count: u32 = self.emit_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let waiters: Vec<EventWaiter> = self.waiters.lock().drain().collect();
        for waiter in waiters {
            trace!(
                "emit(): waking task {:?} of thread {:?} (count={})",
                waiter.task,
                waiter.thread,
                count
            );
            waiter.waker.wake();
        }
        count
    }

    /// Waits until the counter differs from `ref_count` and returns its new value. Raises interrupts.
    pub fn wait(&self, ref_count: u32) -> EventWait<'_> {
        EventWait {
            event: self,
            ref_count,
            interruptible: true,
            key: None,
        }
    }

    /// Same as [ManualEvent::wait], ignoring interrupts.
    pub async fn wait_uninterruptible(&self, ref_count: u32) -> u32 {
        let wait: EventWait = EventWait {
            event: self,
            ref_count,
            interruptible: false,
            key: None,
        };
        match wait.await {
            Ok(count) => count,
            Err(_) => self.emit_count(),
        }
    }

    /// Same as [ManualEvent::wait], giving up after `timeout`. On timeout the current counter is returned, which equals
    /// `ref_count` unless an emission raced with the expiry.
    pub async fn wait_timeout(&self, timeout: Duration, ref_count: u32) -> Result<u32, Fail> {
        let mut wait = self.wait(ref_count).fuse();
        match wait.with_timeout(sleep(timeout)).await {
            Ok(result) => result,
            Err(e) if e.is_timeout() => Ok(self.emit_count()),
            Err(e) => Err(e),
        }
    }
}

impl EventWait<'_> {
    /// Drops the registration unless an emission already consumed it.
    fn deregister(&mut self) {
        if let Some(key) = self.key.take() {
            let mut waiters = self.event.waiters.lock();
            if self.event.emit_count() == self.ref_count {
                waiters.try_remove(key);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ManualEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for EventWait<'_> {
    type Output = Result<u32, Fail>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();

        // Interrupts are observed on resumption and right before suspending, never on the fast path.
        if self_.interruptible && (self_.key.is_some() || self_.event.emit_count() == self_.ref_count) {
            if let Err(e) = check_interrupt() {
                self_.deregister();
                return Poll::Ready(Err(e));
            }
        }

        let mut waiters = self_.event.waiters.lock();
        let count: u32 = self_.event.emit_count();
        if count != self_.ref_count {
            // Any registration was drained by the emission.
            self_.key = None;
            return Poll::Ready(Ok(count));
        }
        match self_.key {
            Some(key) => {
                if let Some(waiter) = waiters.get_mut(key) {
                    if !waiter.waker.will_wake(context.waker()) {
                        waiter.waker = context.waker().clone();
                    }
                }
            },
            None => {
                self_.key = Some(waiters.insert(EventWaiter {
                    thread: thread::current().id(),
                    task: current_task_id(),
                    waker: context.waker().clone(),
                }));
            },
        }
        Poll::Pending
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        self.deregister();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
