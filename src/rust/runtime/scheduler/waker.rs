// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cross-thread entry into a scheduler.
//!
//! Every wakeup, interrupt and deferred exception aimed at a task goes through the inbox of the thread that owns the
//! task. Posting from a foreign thread also triggers the driver signal so that a blocked event loop notices.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    driver::DriverSignal,
    fail::Fail,
    scheduler::task::TaskId,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    task::{
        Wake,
        Waker,
    },
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Debug)]
pub enum InboxMessage {
    Wake(TaskId),
    Interrupt(TaskId),
    Defer(TaskId, Fail),
}

pub struct ThreadInbox {
    thread: ThreadId,
    sender: Sender<InboxMessage>,
    receiver: Receiver<InboxMessage>,
    signal: Arc<dyn DriverSignal>,
    exit_requested: AtomicBool,
}

/// Waker of a single task.
struct TaskWaker {
    inbox: Arc<ThreadInbox>,
    task: TaskId,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ThreadInbox {
    /// Creates the inbox of the calling thread.
    pub fn new(signal: Arc<dyn DriverSignal>) -> Self {
        let (sender, receiver): (Sender<InboxMessage>, Receiver<InboxMessage>) = crossbeam_channel::unbounded();
        Self {
            thread: thread::current().id(),
            sender,
            receiver,
            signal,
            exit_requested: AtomicBool::new(false),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn post(&self, message: InboxMessage) {
        // The receiver lives as long as the inbox, so sending cannot fail.
        if self.sender.send(message).is_err() {
            return;
        }
        if thread::current().id() != self.thread {
            self.signal.trigger();
        }
    }

    /// Takes the next message, if any.
    pub fn try_recv(&self) -> Option<InboxMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Requests the owning event loop to return. Requests made before the loop notices collapse into one.
    pub fn request_exit(&self) {
        if !self.exit_requested.swap(true, Ordering::AcqRel) && thread::current().id() != self.thread {
            self.signal.trigger();
        }
    }

    /// Consumes a pending exit request.
    pub fn take_exit_request(&self) -> bool {
        self.exit_requested.swap(false, Ordering::AcqRel)
    }

    /// Builds the waker of `task`.
    pub fn waker(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            inbox: self.clone(),
            task,
        }))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inbox.post(InboxMessage::Wake(self.task));
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
