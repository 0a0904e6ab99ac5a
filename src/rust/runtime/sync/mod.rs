// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Task-aware synchronization primitives, all layered on broadcast events.

mod condition;
mod event;
mod local_event;
mod lockable;
mod mutex;
mod recursive_mutex;
mod semaphore;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    condition::TaskCondition,
    event::{
        EventWait,
        ManualEvent,
    },
    local_event::{
        LocalEventWait,
        LocalManualEvent,
    },
    lockable::{
        LockGuard,
        Lockable,
    },
    mutex::TaskMutex,
    recursive_mutex::RecursiveTaskMutex,
    semaphore::LocalTaskSemaphore,
};
