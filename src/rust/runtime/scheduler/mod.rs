// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod handle;
mod pool;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;
mod task_local;
mod waker;
mod yielder;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    handle::{
        ExitHandle,
        TaskHandle,
    },
    scheduler::{
        IdleCallback,
        Scheduler,
        SharedScheduler,
    },
    task::{
        TaskFuture,
        TaskId,
        TaskOwner,
        TaskState,
    },
    task_local::TaskLocal,
    waker::ThreadInbox,
    yielder::{
        Yield,
        Yielder,
        YielderHandle,
    },
};
