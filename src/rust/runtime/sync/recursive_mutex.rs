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
        mutex::WaiterGuard,
    },
};
use ::async_trait::async_trait;
use ::parking_lot::Mutex;
use ::std::sync::atomic::{
    AtomicU32,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct RecursiveState {
    owner: Option<TaskOwner>,
    depth: usize,
}

/// Task mutex that its owner may lock again. Each lock must be matched by an unlock from the same task.
pub struct RecursiveTaskMutex {
    state: Mutex<RecursiveState>,
    waiters: AtomicU32,
    event: ManualEvent,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RecursiveTaskMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecursiveState { owner: None, depth: 0 }),
            waiters: AtomicU32::new(0),
            event: ManualEvent::new(),
        }
    }

    pub async fn lock(&self) -> Result<LockGuard<'_, Self>, Fail> {
        self.lock_inner(true).await?;
        Ok(LockGuard::adopt(self))
    }

    pub async fn lock_uninterruptible(&self) -> Result<LockGuard<'_, Self>, Fail> {
        self.lock_inner(false).await?;
        Ok(LockGuard::adopt(self))
    }

    pub fn try_lock(&self) -> Result<Option<LockGuard<'_, Self>>, Fail> {
        let me: TaskOwner = Self::owner()?;
        if self.try_acquire(me) {
            Ok(Some(LockGuard::adopt(self)))
        } else {
            Ok(None)
        }
    }

    /// How many times the owner holds the lock.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    fn owner() -> Result<TaskOwner, Fail> {
        current_owner().ok_or_else(|| {
            let cause: &str = "recursive mutex used outside of a task";
            error!("owner(): {}", cause);
            Fail::new(libc::EPERM, cause)
        })
    }

    fn try_acquire(&self, me: TaskOwner) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            },
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            },
            Some(_) => false,
        }
    }

    async fn lock_inner(&self, interruptible: bool) -> Result<(), Fail> {
        let me: TaskOwner = Self::owner()?;
        loop {
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

    /// Undoes one lock of the calling task.
    pub fn unlock(&self) -> Result<(), Fail> {
        let me: TaskOwner = Self::owner()?;
        let released: bool = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                let cause: String = format!("task {:?} does not own this mutex", me.task);
                error!("unlock(): {}", cause);
                return Err(Fail::new(libc::EPERM, &cause));
            }
            state.depth -= 1;
            if state.depth == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };
        if released && self.waiters.load(Ordering::SeqCst) > 0 {
            self.event.emit();
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for RecursiveTaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Lockable for RecursiveTaskMutex {
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

//======================================================================================================================
// Unit Tests
//======================================================================================================================
