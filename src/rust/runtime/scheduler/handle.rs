// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context,
    fail::Fail,
    scheduler::{
        scheduler::SharedScheduler,
        task::{
            TaskId,
            TaskOwner,
            TaskState,
        },
        waker::{
            InboxMessage,
            ThreadInbox,
        },
    },
};
use ::futures::future;
use ::std::{
    fmt,
    sync::Arc,
    task::Poll,
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task Handle
///
/// Names a task together with the thread that owns it. Handles may be sent to other threads, but a task is only ever
/// resumed by its owner.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    inbox: Arc<ThreadInbox>,
}

/// Requests the event loop of a thread to return. May be used from any thread.
#[derive(Clone)]
pub struct ExitHandle {
    inbox: Arc<ThreadInbox>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskHandle {
    pub(crate) fn new(id: TaskId, inbox: Arc<ThreadInbox>) -> Self {
        Self { id, inbox }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Thread that runs this task.
    pub fn thread(&self) -> ThreadId {
        self.inbox.thread()
    }

    pub fn owner(&self) -> TaskOwner {
        TaskOwner {
            thread: self.thread(),
            task: self.id,
        }
    }

    /// Scheduler of the calling thread, if it is the one that owns this task.
    fn local_scheduler(&self) -> Result<SharedScheduler, Fail> {
        let foreign = || Fail::new(libc::EPERM, "task belongs to another thread");
        if self.thread() != thread::current().id() {
            return Err(foreign());
        }
        match context::try_current_scheduler() {
            Some(scheduler) if Arc::ptr_eq(scheduler.inbox(), &self.inbox) => Ok(scheduler),
            // The scheduler that ran this task was torn down.
            _ => Err(foreign()),
        }
    }

    /// Current state of the task. Only the owning thread may ask.
    pub fn state(&self) -> Result<TaskState, Fail> {
        match self.local_scheduler() {
            Ok(scheduler) => Ok(scheduler.state(self.id)),
            Err(_) if self.thread() == thread::current().id() => Ok(TaskState::Terminated),
            Err(e) => Err(e),
        }
    }

    /// Whether the task has not terminated yet. Only the owning thread may ask.
    pub fn is_running(&self) -> Result<bool, Fail> {
        Ok(self.state()? != TaskState::Terminated)
    }

    /// Waits for the task to terminate. Returns immediately if it already has.
    pub async fn join(&self) -> Result<(), Fail> {
        if self.thread() != thread::current().id() {
            let cause: String = format!("cannot join task {} of another thread", self.id);
            error!("join(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        let Ok(scheduler) = self.local_scheduler() else {
            return Ok(());
        };
        if scheduler.current_task() == Some(self.id) {
            let cause: String = format!("task {} cannot join itself", self.id);
            error!("join(): {}", cause);
            return Err(Fail::new(libc::EDEADLK, &cause));
        }

        let id: TaskId = self.id;
        let mut suspended: bool = false;
        future::poll_fn(|context| {
            if suspended {
                scheduler.check_interrupt()?;
            }
            if scheduler.state(id) == TaskState::Terminated {
                return Poll::Ready(Ok(()));
            }
            if !suspended {
                scheduler.check_interrupt()?;
            }
            if !scheduler.register_join(id, context.waker()) {
                return Poll::Ready(Ok(()));
            }
            suspended = true;
            Poll::Pending
        })
        .await
    }

    /// Interrupts the task. It observes the interruption at its next interruptible suspension point, and is woken to
    /// do so if it is suspended. Has no effect on a task that already terminated.
    pub fn interrupt(&self) {
        match self.local_scheduler() {
            Ok(scheduler) => scheduler.interrupt(self.id),
            Err(_) => self.inbox.post(InboxMessage::Interrupt(self.id)),
        }
    }

    /// Records an exception that the task raises at its next interruptible suspension point.
    pub(crate) fn defer(&self, e: Fail) {
        self.inbox.post(InboxMessage::Defer(self.id, e));
    }
}

impl ExitHandle {
    pub(crate) fn new(inbox: Arc<ThreadInbox>) -> Self {
        Self { inbox }
    }

    pub fn thread(&self) -> ThreadId {
        self.inbox.thread()
    }

    pub fn exit_event_loop(&self) {
        self.inbox.request_exit();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.thread() == other.thread()
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("thread", &self.thread())
            .finish()
    }
}
