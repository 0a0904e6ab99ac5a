// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    check_interrupt,
    fail::Fail,
    timer::{
        sleep,
        UtilityMethods,
    },
};
use ::futures::FutureExt;
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{
        Context,
        Poll,
        Waker,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct LocalEventState {
    emit_count: u32,
    waiters: Slab<Waker>,
}

/// Broadcast event confined to the tasks of one thread. Clones share the same event.
#[derive(Clone)]
pub struct LocalManualEvent(Rc<RefCell<LocalEventState>>);

pub struct LocalEventWait<'a> {
    event: &'a LocalManualEvent,
    ref_count: u32,
    interruptible: bool,
    key: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LocalManualEvent {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(LocalEventState {
            emit_count: 0,
            waiters: Slab::new(),
        })))
    }

    pub fn emit_count(&self) -> u32 {
        self.0.borrow().emit_count
    }

    pub fn waiter_count(&self) -> usize {
        self.0.borrow().waiters.len()
    }

    /// Bumps the counter and wakes every current waiter. Returns the new counter.
    pub fn emit(&self) -> u32 {
        let (count, waiters): (u32, Vec<Waker>) = {
            let mut state = self.0.borrow_mut();
            state.emit_count = state.emit_count.wrapping_add(1);
            (state.emit_count, state.waiters.drain().collect())
        };
        for waker in waiters {
            waker.wake();
        }
        count
    }

    /// Waits until the counter differs from `ref_count` and returns its new value. Raises interrupts.
    pub fn wait(&self, ref_count: u32) -> LocalEventWait<'_> {
        LocalEventWait {
            event: self,
            ref_count,
            interruptible: true,
            key: None,
        }
    }

    pub async fn wait_uninterruptible(&self, ref_count: u32) -> u32 {
        let wait: LocalEventWait = LocalEventWait {
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

    /// Same as [LocalManualEvent::wait], giving up after `timeout` with the current counter.
    pub async fn wait_timeout(&self, timeout: Duration, ref_count: u32) -> Result<u32, Fail> {
        let mut wait = self.wait(ref_count).fuse();
        match wait.with_timeout(sleep(timeout)).await {
            Ok(result) => result,
            Err(e) if e.is_timeout() => Ok(self.emit_count()),
            Err(e) => Err(e),
        }
    }
}

impl LocalEventWait<'_> {
    fn deregister(&mut self) {
        if let Some(key) = self.key.take() {
            let waker: Option<Waker> = {
                let mut state = self.event.0.borrow_mut();
                if state.emit_count == self.ref_count {
                    state.waiters.try_remove(key)
                } else {
                    None
                }
            };
            drop(waker);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LocalManualEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for LocalEventWait<'_> {
    type Output = Result<u32, Fail>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();

        if self_.interruptible && (self_.key.is_some() || self_.event.emit_count() == self_.ref_count) {
            if let Err(e) = check_interrupt() {
                self_.deregister();
                return Poll::Ready(Err(e));
            }
        }

        let mut state = self_.event.0.borrow_mut();
        if state.emit_count != self_.ref_count {
            self_.key = None;
            return Poll::Ready(Ok(state.emit_count));
        }
        match self_.key {
            Some(key) => {
                if let Some(waker) = state.waiters.get_mut(key) {
                    if !waker.will_wake(context.waker()) {
                        *waker = context.waker().clone();
                    }
                }
            },
            None => self_.key = Some(state.waiters.insert(context.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for LocalEventWait<'_> {
    fn drop(&mut self) {
        self.deregister();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
