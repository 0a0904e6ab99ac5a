// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
    sync::local_event::LocalManualEvent,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    cmp::Reverse,
    collections::BTreeMap,
    mem,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Position of a waiter in the queue: earlier sequence first, then higher priority, then earlier arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct WaiterKey {
    seq: u32,
    priority: Reverse<u8>,
    id: u64,
}

struct SemaphoreWaiter {
    key: Cell<WaiterKey>,
    granted: Cell<bool>,
    event: LocalManualEvent,
}

struct SemaphoreState {
    max_locks: usize,
    locks: usize,
    seq: u32,
    next_waiter: u64,
    waiters: BTreeMap<WaiterKey, Rc<SemaphoreWaiter>>,
}

/// Counting semaphore for the tasks of one thread. Released slots are handed directly to the head of the queue.
pub struct LocalTaskSemaphore {
    state: RefCell<SemaphoreState>,
}

/// Queue entry of a task suspended in [LocalTaskSemaphore::lock].
struct WaiterRegistration<'a> {
    semaphore: &'a LocalTaskSemaphore,
    waiter: Rc<SemaphoreWaiter>,
    observed: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SemaphoreState {
    /// Renumbers the queued sequences densely from zero, preserving the queue order.
    fn rebase(&mut self) {
        trace!("rebase(): renumbering {} waiters (seq={})", self.waiters.len(), self.seq);
        let waiters: BTreeMap<WaiterKey, Rc<SemaphoreWaiter>> = mem::take(&mut self.waiters);
        let mut seq: u32 = 0;
        for (mut key, waiter) in waiters {
            key.seq = seq;
            seq += 1;
            waiter.key.set(key);
            self.waiters.insert(key, waiter);
        }
        self.seq = seq;
    }

    /// Grants free slots to the head of the queue. Returns the waiters to wake.
    fn dispatch(&mut self) -> Vec<Rc<SemaphoreWaiter>> {
        let mut granted: Vec<Rc<SemaphoreWaiter>> = Vec::new();
        while self.locks < self.max_locks {
            let Some((_, waiter)) = self.waiters.pop_first() else {
                break;
            };
            self.locks += 1;
            waiter.granted.set(true);
            granted.push(waiter);
        }
        granted
    }
}

impl LocalTaskSemaphore {
    pub fn new(max_locks: usize) -> Self {
        Self {
            state: RefCell::new(SemaphoreState {
                max_locks,
                locks: 0,
                seq: 0,
                next_waiter: 0,
                waiters: BTreeMap::new(),
            }),
        }
    }

    pub fn max_locks(&self) -> usize {
        self.state.borrow().max_locks
    }

    /// Number of slots that can be taken right now.
    pub fn available(&self) -> usize {
        let state = self.state.borrow();
        state.max_locks.saturating_sub(state.locks)
    }

    pub fn waiter_count(&self) -> usize {
        self.state.borrow().waiters.len()
    }

    /// Changes the number of slots. Raising it admits waiters; lowering it only throttles future admissions.
    pub fn set_max_locks(&self, max_locks: usize) {
        let granted: Vec<Rc<SemaphoreWaiter>> = {
            let mut state = self.state.borrow_mut();
            state.max_locks = max_locks;
            state.dispatch()
        };
        Self::wake(granted);
    }

    /// Takes a slot if one is free and nobody is queued for it.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.waiters.is_empty() && state.locks < state.max_locks {
            state.locks += 1;
            true
        } else {
            false
        }
    }

    /// Takes a slot, waiting behind earlier and higher-priority waiters.
    ///
    /// An interrupt delivered while waiting fails the wait and gives up the place in the queue, or passes on a slot
    /// that was already handed over.
    pub async fn lock(&self, priority: u8) -> Result<(), Fail> {
        self.lock_inner(priority, true).await
    }

    /// Same as [LocalTaskSemaphore::lock], ignoring interrupts.
    pub async fn lock_uninterruptible(&self, priority: u8) {
        // Nothing can fail without interrupts.
        if self.lock_inner(priority, false).await.is_err() {
            warn!("lock_uninterruptible(): unexpected failure");
        }
    }

    async fn lock_inner(&self, priority: u8, interruptible: bool) -> Result<(), Fail> {
        if self.try_lock() {
            return Ok(());
        }

        let waiter: Rc<SemaphoreWaiter> = {
            let mut state = self.state.borrow_mut();
            if state.seq >= limits::SEMAPHORE_SEQUENCE_REBASE {
                state.rebase();
            }
            let key: WaiterKey = WaiterKey {
                seq: state.seq.saturating_sub(priority as u32),
                priority: Reverse(priority),
                id: state.next_waiter,
            };
            state.seq = state.seq.saturating_add(1);
            state.next_waiter += 1;
            let waiter: Rc<SemaphoreWaiter> = Rc::new(SemaphoreWaiter {
                key: Cell::new(key),
                granted: Cell::new(false),
                event: LocalManualEvent::new(),
            });
            state.waiters.insert(key, waiter.clone());
            waiter
        };

        let mut registration: WaiterRegistration = WaiterRegistration {
            semaphore: self,
            waiter,
            observed: false,
        };
        while !registration.waiter.granted.get() {
            let count: u32 = registration.waiter.event.emit_count();
            if interruptible {
                // On failure the registration leaves the queue, or passes on a slot granted in the meantime.
                registration.waiter.event.wait(count).await?;
            } else {
                registration.waiter.event.wait_uninterruptible(count).await;
            }
        }
        registration.observed = true;
        Ok(())
    }

    /// Gives a slot back, handing it to the head waiter if there is one.
    pub fn unlock(&self) -> Result<(), Fail> {
        let granted: Vec<Rc<SemaphoreWaiter>> = {
            let mut state = self.state.borrow_mut();
            if state.locks == 0 {
                let cause: &str = "semaphore is not locked";
                error!("unlock(): {}", cause);
                return Err(Fail::new(libc::EPERM, cause));
            }
            state.locks -= 1;
            state.dispatch()
        };
        Self::wake(granted);
        Ok(())
    }

    fn wake(granted: Vec<Rc<SemaphoreWaiter>>) {
        for waiter in granted {
            waiter.event.emit();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        if self.observed {
            return;
        }
        if self.waiter.granted.get() {
            // The slot was handed to a waiter that went away before resuming.
            if let Err(e) = self.semaphore.unlock() {
                warn!("drop(): failed to pass on semaphore slot ({:?})", e);
            }
        } else {
            let key: WaiterKey = self.waiter.key.get();
            self.semaphore.state.borrow_mut().waiters.remove(&key);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
