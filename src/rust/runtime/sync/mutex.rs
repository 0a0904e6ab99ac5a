// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::current_owner,
    fail::Fail,
    scheduler::TaskOwner,
    sync::{
        event::ManualEvent,
        lockable::{
            LockGuard,
            Lockable,
        },
    },
};
use ::async_trait::async_trait;
use ::parking_lot::Mutex;
use ::std::sync::atomic::{
    AtomicBool,
    AtomicU32,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Mutex for ensuring exclusive access across tasks, including tasks of different threads.
pub struct TaskMutex {
    locked: AtomicBool,
    /// Number of tasks in the slow path. Unlocking only emits if there are any.
    waiters: AtomicU32,
    owner: Mutex<Option<TaskOwner>>,
    event: ManualEvent,
}

/// Counts a task as waiting on a lock for as long as it lives.
pub(super) struct WaiterGuard<'a>(&'a AtomicU32);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskMutex {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: AtomicU32::new(0),
            owner: Mutex::new(None),
            event: ManualEvent::new(),
        }
    }

    /// Acquire this lock. Interrupts raised while waiting leave the mutex untouched.
    pub async fn lock(&self) -> Result<LockGuard<'_, Self>, Fail> {
        self.lock_inner(true).await?;
        Ok(LockGuard::adopt(self))
    }

    /// Acquire this lock, ignoring interrupts. Only fails on re-entry.
    pub async fn lock_uninterruptible(&self) -> Result<LockGuard<'_, Self>, Fail> {
        self.lock_inner(false).await?;
        Ok(LockGuard::adopt(self))
    }

    /// Try to acquire this lock without waiting.
    pub fn try_lock(&self) -> Option<LockGuard<'_, Self>> {
        if self.try_acquire(current_owner()) {
            Some(LockGuard::adopt(self))
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting for the lock.
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::SeqCst)
    }

    fn try_acquire(&self, owner: Option<TaskOwner>) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.owner.lock() = owner;
            true
        } else {
            false
        }
    }

    async fn lock_inner(&self, interruptible: bool) -> Result<(), Fail> {
        let me: Option<TaskOwner> = current_owner();
        loop {
            if self.try_acquire(me) {
                return Ok(());
            }
            if me.is_some() && *self.owner.lock() == me {
                let cause: String = format!("task {:?} already holds this mutex", me);
                error!("lock(): {}", cause);
                return Err(Fail::new(libc::EDEADLK, &cause));
            }

            // Capture the counter and announce ourselves before the last attempt, so that an unlock in between emits.
            let count: u32 = self.event.emit_count();
            let _waiter: WaiterGuard = WaiterGuard::new(&self.waiters);
            if self.try_acquire(me) {
                return Ok(());
            }
            if interruptible {
                self.event.wait(count).await?;
            } else {
                self.event.wait_uninterruptible(count).await;
            }
        }
    }

    /// Release this lock.
    pub fn unlock(&self) -> Result<(), Fail> {
        {
            let mut owner = self.owner.lock();
            if !self.locked.load(Ordering::SeqCst) {
                let cause: &str = "mutex was not locked";
                error!("unlock(): {}", cause);
                return Err(Fail::new(libc::EPERM, cause));
            }
            *owner = None;
            self.locked.store(false, Ordering::SeqCst);
        }
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.event.emit();
        }
        Ok(())
    }
}

impl<'a> WaiterGuard<'a> {
    pub(super) fn new(waiters: &'a AtomicU32) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self(waiters)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Lockable for TaskMutex {
    async fn acquire(&self) -> Result<(), Fail> {
        self.lock_inner(true).await
    }

    async fn acquire_uninterruptible(&self) -> Result<(), Fail> {
        self.lock_inner(false).await
    }

    fn release(&self) -> Result<(), Fail> {
        self.unlock()
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
