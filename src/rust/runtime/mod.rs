// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime entry points.
//!
//! Free functions in this module act on the scheduler of the calling thread, which is created on first use.

pub mod config;
pub mod context;
pub mod driver;
pub mod fail;
pub mod limits;
pub mod logging;
pub mod scheduler;
pub mod sync;
pub mod timer;
pub mod worker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    context::{
        initialize,
        initialize_thread,
        shutdown,
        teardown_thread,
    },
    timer::sleep,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    driver::ExitReason,
    fail::Fail,
    scheduler::{
        ExitHandle,
        SharedScheduler,
        TaskFuture,
        TaskHandle,
        TaskId,
        Yield,
    },
    worker::Job,
};
use ::std::{
    future::Future,
    mem,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Fails if a task closure is too large to be stored inline in a fiber slot.
fn check_closure_size<F>() -> Result<(), Fail> {
    let size: usize = mem::size_of::<F>();
    if size > limits::TASK_CLOSURE_SIZE_MAX {
        let cause: String = format!(
            "task closure is {} bytes, the limit is {} bytes",
            size,
            limits::TASK_CLOSURE_SIZE_MAX
        );
        error!("spawn(): {}", cause);
        return Err(Fail::new(libc::E2BIG, &cause));
    }
    Ok(())
}

fn spawn_inner<F, Fut>(name: Option<&str>, f: F) -> Result<TaskHandle, Fail>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), Fail>> + 'static,
{
    check_closure_size::<F>()?;
    let scheduler: SharedScheduler = context::current_scheduler()?;
    let future: TaskFuture = Box::pin(async move { f().await });
    let id: TaskId = scheduler.spawn(name, future);
    Ok(TaskHandle::new(id, scheduler.inbox().clone()))
}

/// Creates a task on the calling thread and runs it until its first suspension point.
pub fn spawn<F, Fut>(f: F) -> Result<TaskHandle, Fail>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), Fail>> + 'static,
{
    spawn_inner(None, f)
}

/// Same as [spawn], naming the task for diagnostics.
pub fn spawn_named<F, Fut>(name: &str, f: F) -> Result<TaskHandle, Fail>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), Fail>> + 'static,
{
    spawn_inner(Some(name), f)
}

/// Runs a task on one of the shared worker threads.
pub fn spawn_on_worker<F, Fut>(f: F) -> Result<(), Fail>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Fail>> + 'static,
{
    check_closure_size::<F>()?;
    let job: Job = Box::new(move || spawn(f).map(|_| ()));
    context::runtime_or_default()?.submit(job)
}

/// Lets the other ready tasks of this thread run before continuing. Raises the pending interrupt or deferred exception
/// of the task once it resumes.
pub async fn yield_now() -> Result<(), Fail> {
    Yield::new().await;
    check_interrupt()
}

/// Raises the pending interrupt or deferred exception of the running task. Does nothing outside of a task.
pub fn check_interrupt() -> Result<(), Fail> {
    match context::try_current_scheduler() {
        Some(scheduler) => scheduler.check_interrupt(),
        None => Ok(()),
    }
}

/// Handle of the running task, if any.
pub fn current_task() -> Option<TaskHandle> {
    let scheduler: SharedScheduler = context::try_current_scheduler()?;
    let id: TaskId = scheduler.current_task()?;
    Some(TaskHandle::new(id, scheduler.inbox().clone()))
}

/// Runs the event loop of this thread until an exit is requested or nothing is left to wait for.
pub fn run_event_loop() -> Result<i32, Fail> {
    Ok(context::current_scheduler()?.run_event_loop())
}

/// Runs a single, possibly blocking, iteration of the event loop of this thread.
pub fn run_event_loop_once() -> Result<ExitReason, Fail> {
    Ok(context::current_scheduler()?.run_event_loop_once())
}

/// Processes whatever is ready without blocking. Returns false once an exit has been requested.
pub fn process_events() -> Result<bool, Fail> {
    Ok(context::current_scheduler()?.process_events())
}

/// Requests the event loop of this thread to return.
pub fn exit_event_loop() -> Result<(), Fail> {
    context::current_scheduler()?.exit_event_loop();
    Ok(())
}

/// Returns a handle that can stop the event loop of this thread from elsewhere.
pub fn exit_handle() -> Result<ExitHandle, Fail> {
    Ok(ExitHandle::new(context::current_scheduler()?.inbox().clone()))
}

/// Requests every event loop of the process to return.
pub fn exit_all_event_loops() {
    for inbox in context::registered_inboxes() {
        inbox.request_exit();
    }
}

/// Installs the hook that runs once the ready queue and the inbox of this thread have been drained.
pub fn set_idle_callback<F>(callback: F) -> Result<(), Fail>
where
    F: FnMut() -> bool + 'static,
{
    context::current_scheduler()?.set_idle_callback(Some(Box::new(callback)));
    Ok(())
}

pub fn clear_idle_callback() -> Result<(), Fail> {
    context::current_scheduler()?.set_idle_callback(None);
    Ok(())
}
