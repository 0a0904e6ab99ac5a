// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    sync::{
        event::ManualEvent,
        lockable::{
            LockGuard,
            Lockable,
        },
    },
};
use ::std::time::Duration;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Condition variable for tasks holding a [Lockable].
pub struct TaskCondition {
    event: ManualEvent,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskCondition {
    pub fn new() -> Self {
        Self {
            event: ManualEvent::new(),
        }
    }

    /// Releases the lock held by `guard`, waits for a notification, and takes the lock back.
    ///
    /// The lock is taken back before this returns, even when the wait was interrupted. The interrupt is then raised
    /// and the guard dropped with it.
    pub async fn wait<'a, L: Lockable + ?Sized>(&self, guard: LockGuard<'a, L>) -> Result<LockGuard<'a, L>, Fail> {
        let lock: &'a L = guard.lockable();
        let count: u32 = self.event.emit_count();
        guard.unlock()?;
        let result: Result<u32, Fail> = self.event.wait(count).await;
        lock.acquire_uninterruptible().await?;
        let guard: LockGuard<'a, L> = LockGuard::adopt(lock);
        result?;
        Ok(guard)
    }

    /// Same as [TaskCondition::wait], giving up after `timeout`. Reports whether a notification was received.
    pub async fn wait_timeout<'a, L: Lockable + ?Sized>(
        &self,
        guard: LockGuard<'a, L>,
        timeout: Duration,
    ) -> Result<(LockGuard<'a, L>, bool), Fail> {
        let lock: &'a L = guard.lockable();
        let count: u32 = self.event.emit_count();
        guard.unlock()?;
        let result: Result<u32, Fail> = self.event.wait_timeout(timeout, count).await;
        lock.acquire_uninterruptible().await?;
        let guard: LockGuard<'a, L> = LockGuard::adopt(lock);
        let notified: bool = result? != count;
        Ok((guard, notified))
    }

    /// Wakes the waiting tasks. Same as [TaskCondition::notify_all], since waiters re-check their predicate.
    pub fn notify(&self) {
        self.event.emit();
    }

    pub fn notify_all(&self) {
        self.event.emit();
    }

    pub fn waiter_count(&self) -> usize {
        self.event.waiter_count()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TaskCondition {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
