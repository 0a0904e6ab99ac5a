// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::async_trait::async_trait;
use ::std::{
    fmt,
    mem::ManuallyDrop,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Raw locking interface shared by the task mutexes, used by [crate::TaskCondition].
#[async_trait(?Send)]
pub trait Lockable {
    /// Acquires the lock, raising interrupts while waiting.
    async fn acquire(&self) -> Result<(), Fail>;

    /// Acquires the lock, ignoring interrupts. Fails only on misuse, such as re-entering a non-recursive lock.
    async fn acquire_uninterruptible(&self) -> Result<(), Fail>;

    /// Releases the lock held by the caller.
    fn release(&self) -> Result<(), Fail>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Holds a lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, L: Lockable + ?Sized> {
    lock: &'a L,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<'a, L: Lockable + ?Sized> LockGuard<'a, L> {
    /// Wraps a lock that the caller already holds.
    pub(crate) fn adopt(lock: &'a L) -> Self {
        Self { lock }
    }

    /// Lock this guard holds.
    pub fn lockable(&self) -> &'a L {
        self.lock
    }

    /// Releases the lock, reporting misuse instead of logging it.
    pub fn unlock(self) -> Result<(), Fail> {
        let guard: ManuallyDrop<Self> = ManuallyDrop::new(self);
        guard.lock.release()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<L: Lockable + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("drop(): failed to release lock ({:?})", e);
        }
    }
}

impl<L: Lockable + ?Sized> fmt::Debug for LockGuard<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard")
    }
}
