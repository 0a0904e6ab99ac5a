// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    any::Any,
    fmt,
    future::Future,
    pin::Pin,
    task::Waker,
    thread::ThreadId,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Body of a task once its closure has been invoked.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Fail>>>>;

/// Identifier of a task within its thread. The generation disambiguates successive occupants of a fiber slot.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct TaskId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// Lifecycle of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Unstarted,
    Running,
    Yielded,
    WaitingOnEvent,
    Terminated,
}

/// A task together with the thread that runs it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskOwner {
    pub thread: ThreadId,
    pub task: TaskId,
}

/// Control block of a fiber slot.
pub struct FiberSlot {
    pub generation: u32,
    pub state: TaskState,
    pub name: Option<String>,
    /// Taken out while the task is being polled.
    pub future: Option<TaskFuture>,
    pub waker: Option<Waker>,
    pub locals: Vec<Option<Box<dyn Any>>>,
    pub interrupted: bool,
    pub deferred: Option<Fail>,
    /// Set while a wakeup for this task sits in the run list.
    pub queued: bool,
    pub join_waiters: Vec<Waker>,
}

/// What is left of a task after it terminates. Dropped outside of any scheduler borrow.
pub struct TaskRemains {
    pub name: Option<String>,
    pub locals: Vec<Box<dyn Any>>,
    pub join_waiters: Vec<Waker>,
    pub interrupted: bool,
    pub deferred: Option<Fail>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskId {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl FiberSlot {
    /// Whether the slot currently hosts a task.
    pub fn is_live(&self) -> bool {
        self.state != TaskState::Terminated
    }

    /// Moves everything the finished task owns out of the slot. Storage capacity stays with the slot.
    pub fn clear(&mut self) -> TaskRemains {
        self.state = TaskState::Terminated;
        self.future = None;
        self.waker = None;
        self.queued = false;
        TaskRemains {
            name: self.name.take(),
            locals: self.locals.iter_mut().filter_map(Option::take).collect(),
            join_waiters: self.join_waiters.drain(..).collect(),
            interrupted: ::std::mem::replace(&mut self.interrupted, false),
            deferred: self.deferred.take(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for FiberSlot {
    fn default() -> Self {
        Self {
            generation: 0,
            state: TaskState::Terminated,
            name: None,
            future: None,
            waker: None,
            locals: Vec::new(),
            interrupted: false,
            deferred: None,
            queued: false,
            join_waiters: Vec::new(),
        }
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.slot, self.generation)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.generation)
    }
}
