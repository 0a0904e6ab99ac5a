// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::try_current_scheduler,
    fail::Fail,
    scheduler::handle::TaskHandle,
};
use ::parking_lot::Mutex;
use ::std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Yield is a future that lets the currently running task cooperatively give way to the other ready tasks of its
/// thread. The task runs again within the next loop iteration. Interrupts are left to the caller, see
/// [crate::runtime::yield_now].
pub struct Yield {
    already_yielded: bool,
}

struct YieldState {
    /// Result the task should be woken with.
    result: Option<Result<(), Fail>>,
    waker: Option<Waker>,
    /// Whether the task is suspended in [Yielder::yield_until_wake].
    waiting: bool,
}

/// Yield Handle
///
/// Used by a backend to wake a task that suspended in [Yielder::yield_until_wake]. The handle may be moved to other
/// threads; the task itself is still resumed by its own thread.
#[derive(Clone)]
pub struct YielderHandle {
    state: Arc<Mutex<YieldState>>,
    task: Option<TaskHandle>,
}

/// Yielder lets a single task suspend until a backend wakes it. The yield handle can be used to wake the task.
pub struct Yielder {
    yielder_handle: YielderHandle,
}

/// Suspension in [Yielder::yield_until_wake].
struct WaitForWake {
    state: Arc<Mutex<YieldState>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Yield {
    pub fn new() -> Self {
        Self { already_yielded: false }
    }
}

impl YielderHandle {
    fn new(task: Option<TaskHandle>) -> Self {
        Self {
            state: Arc::new(Mutex::new(YieldState {
                result: None,
                waker: None,
                waiting: false,
            })),
            task,
        }
    }

    /// Wake the yielded task: Ok indicates there is work to be done and Fail indicates the task should stop with an
    /// error. A failure aimed at a task that is not waiting is raised at its next interruptible suspension point.
    pub fn wake_with(&self, result: Result<(), Fail>) {
        let mut state = self.state.lock();
        if !state.waiting {
            if let (Err(e), Some(task)) = (&result, &self.task) {
                drop(state);
                task.defer(e.clone());
                return;
            }
        }
        if let Some(old_result) = state.result.replace(result) {
            debug!("wake_with(): already scheduled, overwriting result (old={:?})", old_result);
        }
        if let Some(waker) = state.waker.take() {
            drop(state);
            waker.wake();
        }
    }

    /// Whether the task is currently suspended waiting for this handle.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    /// Task this handle wakes, if the yielder was created inside one.
    pub fn task(&self) -> Option<&TaskHandle> {
        self.task.as_ref()
    }
}

impl Yielder {
    /// Create a new Yielder object for the running task.
    pub fn new() -> Self {
        Self {
            yielder_handle: YielderHandle::new(crate::runtime::current_task()),
        }
    }

    /// Return a handle to this Yielder for waking the yielded task.
    pub fn get_handle(&self) -> YielderHandle {
        self.yielder_handle.clone()
    }

    /// Suspends until woken with a signal. A stored result completes this right away.
    pub async fn yield_until_wake(&self) -> Result<(), Fail> {
        WaitForWake {
            state: self.yielder_handle.state.clone(),
        }
        .await
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Yield {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Yielder {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.already_yielded {
            return Poll::Ready(());
        }
        self_.already_yielded = true;
        let queued: bool = try_current_scheduler().is_some_and(|scheduler| scheduler.yield_current());
        // Outside of a task, rely on whoever polls us.
        if !queued {
            context.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

impl Future for WaitForWake {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();

        // First check if we've been woken to do some work.
        {
            let mut state = self_.state.lock();
            if let Some(result) = state.result.take() {
                state.waiting = false;
                return Poll::Ready(result);
            }
        }

        if let Err(e) = crate::runtime::check_interrupt() {
            let mut state = self_.state.lock();
            state.waiting = false;
            state.waker = None;
            return Poll::Ready(Err(e));
        }

        let mut state = self_.state.lock();
        // A foreign thread may have delivered in the meantime.
        if let Some(result) = state.result.take() {
            state.waiting = false;
            return Poll::Ready(result);
        }
        state.waiting = true;
        state.waker = Some(context.waker().clone());
        Poll::Pending
    }
}

impl Drop for WaitForWake {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.waiting = false;
        state.waker = None;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
