// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our single-threaded, run-to-suspension task scheduler.
//!
//! Tasks live in pooled fiber slots ([FiberPool]). A task runs until it returns [Poll::Pending] and only resumes on
//! this thread: either from the yielded queue within the same loop iteration, or once a wakeup for it has been drained
//! from the thread's [ThreadInbox]. Blocking for new events is delegated to the [EventDriver].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    driver::{
        EventDriver,
        ExitReason,
    },
    fail::Fail,
    scheduler::{
        pool::FiberPool,
        task::{
            FiberSlot,
            TaskFuture,
            TaskId,
            TaskRemains,
            TaskState,
        },
        waker::{
            InboxMessage,
            ThreadInbox,
        },
    },
};
use ::std::{
    any::Any,
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    mem,
    ops::Deref,
    rc::Rc,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
    thread::ThreadId,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Hook run once the ready queue and the inbox have been drained. Returning true asks for another pass without
/// blocking.
pub type IdleCallback = Box<dyn FnMut() -> bool>;

/// Task Scheduler
pub struct Scheduler {
    driver: Rc<dyn EventDriver>,
    inbox: Arc<ThreadInbox>,
    pool: RefCell<FiberPool>,
    // Task being polled, if any. Restored on the way out of nested resumptions.
    current: Cell<Option<TaskId>>,
    // Tasks that yielded since the last snapshot.
    yielded: RefCell<VecDeque<TaskId>>,
    idle_callback: RefCell<Option<IdleCallback>>,
    // Bumped whenever the idle hook is replaced or cleared.
    idle_epoch: Cell<u64>,
}

#[derive(Clone)]
pub struct SharedScheduler(Rc<Scheduler>);

/// Marks a task as the current one for the duration of a poll.
struct CurrentTaskGuard<'a> {
    current: &'a Cell<Option<TaskId>>,
    previous: Option<TaskId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    pub fn new(driver: Rc<dyn EventDriver>, fiber_pool_size: usize) -> Self {
        let inbox: Arc<ThreadInbox> = Arc::new(ThreadInbox::new(driver.create_manual_event()));
        Self {
            driver,
            inbox,
            pool: RefCell::new(FiberPool::new(fiber_pool_size)),
            current: Cell::new(None),
            yielded: RefCell::new(VecDeque::new()),
            idle_callback: RefCell::new(None),
            idle_epoch: Cell::new(0),
        }
    }

    pub fn driver(&self) -> Rc<dyn EventDriver> {
        self.driver.clone()
    }

    pub fn inbox(&self) -> &Arc<ThreadInbox> {
        &self.inbox
    }

    pub fn thread(&self) -> ThreadId {
        self.inbox.thread()
    }

    /// Returns the running task id if we are inside a task, otherwise None.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current.get()
    }

    /// Places `future` in a fiber slot and runs it until its first suspension point.
    pub fn spawn(&self, name: Option<&str>, future: TaskFuture) -> TaskId {
        let id: TaskId = {
            let mut pool = self.pool.borrow_mut();
            let id: TaskId = pool.allocate();
            if let Some(slot) = pool.get_mut(id) {
                slot.name = name.map(str::to_string);
                slot.future = Some(future);
                slot.waker = Some(self.inbox.waker(id));
            }
            id
        };
        trace!("spawn(): task={} name={:?}", id, name);
        self.resume(id);
        id
    }

    /// Polls a task once. Does nothing if the task is gone or is already being polled further up the stack.
    pub fn resume(&self, id: TaskId) {
        let (mut future, waker): (TaskFuture, Waker) = {
            let mut pool = self.pool.borrow_mut();
            let Some(slot) = pool.get_mut(id) else {
                return;
            };
            slot.queued = false;
            let (Some(future), Some(waker)) = (slot.future.take(), slot.waker.clone()) else {
                return;
            };
            slot.state = TaskState::Running;
            (future, waker)
        };

        let poll: Poll<Result<(), Fail>> = {
            let _guard: CurrentTaskGuard = CurrentTaskGuard::enter(&self.current, id);
            let mut context: Context = Context::from_waker(&waker);
            future.as_mut().poll(&mut context)
        };

        match poll {
            Poll::Pending => {
                let orphan: Option<TaskFuture> = {
                    let mut pool = self.pool.borrow_mut();
                    match pool.get_mut(id) {
                        Some(slot) => {
                            if slot.state == TaskState::Running {
                                slot.state = TaskState::WaitingOnEvent;
                            }
                            slot.future = Some(future);
                            None
                        },
                        None => Some(future),
                    }
                };
                drop(orphan);
            },
            Poll::Ready(result) => {
                drop(future);
                self.terminate(id, result);
            },
        }
    }

    fn terminate(&self, id: TaskId, result: Result<(), Fail>) {
        let Some(remains) = self.pool.borrow_mut().release(id) else {
            return;
        };
        let TaskRemains {
            name,
            locals,
            join_waiters,
            interrupted,
            deferred,
        } = remains;
        if let Err(e) = result {
            warn!("task {} ({:?}) failed: {:?}", id, name, e);
        }
        if interrupted {
            debug!("terminate(): task {} exited with an unobserved interrupt", id);
        }
        if let Some(e) = deferred {
            debug!("terminate(): task {} exited with an unobserved exception: {:?}", id, e);
        }
        drop(locals);
        for waker in join_waiters {
            waker.wake();
        }
        trace!("terminate(): task={} name={:?}", id, name);
    }

    /// Runs everything that is ready: tasks that yielded before this call, then tasks woken through the inbox.
    /// Returns the number of tasks resumed.
    pub fn schedule(&self) -> usize {
        let mut run: Vec<TaskId> = self.yielded.borrow_mut().drain(..).collect();
        while let Some(message) = self.inbox.try_recv() {
            match message {
                InboxMessage::Wake(id) => self.queue(id, &mut run),
                InboxMessage::Interrupt(id) => {
                    if self.mark_interrupted(id) {
                        self.queue(id, &mut run);
                    }
                },
                InboxMessage::Defer(id, e) => {
                    if self.mark_deferred(id, e) {
                        self.queue(id, &mut run);
                    }
                },
            }
        }
        let count: usize = run.len();
        for id in run {
            self.resume(id);
        }
        count
    }

    /// Adds a waiting task to the run list unless it is already there.
    fn queue(&self, id: TaskId, run: &mut Vec<TaskId>) {
        let mut pool = self.pool.borrow_mut();
        if let Some(slot) = pool.get_mut(id) {
            if slot.state == TaskState::WaitingOnEvent && !slot.queued {
                slot.queued = true;
                run.push(id);
            }
        }
    }

    /// Flags a task for cancellation. Returns true if it must be woken to observe the flag.
    fn mark_interrupted(&self, id: TaskId) -> bool {
        let mut pool = self.pool.borrow_mut();
        match pool.get_mut(id) {
            Some(slot) => {
                slot.interrupted = true;
                slot.state == TaskState::WaitingOnEvent
            },
            None => false,
        }
    }

    /// Records an exception to be raised at the next interruptible wait of a task. Returns true if it must be woken.
    fn mark_deferred(&self, id: TaskId, e: Fail) -> bool {
        let mut pool = self.pool.borrow_mut();
        match pool.get_mut(id) {
            Some(slot) => {
                if let Some(old) = slot.deferred.replace(e) {
                    debug!("mark_deferred(): overwriting pending exception (task={}, old={:?})", id, old);
                }
                slot.state == TaskState::WaitingOnEvent
            },
            None => false,
        }
    }

    /// Interrupts a task of this thread. The running task is only flagged; a suspended one is also woken.
    pub fn interrupt(&self, id: TaskId) {
        if self.mark_interrupted(id) {
            self.inbox.post(InboxMessage::Wake(id));
        }
    }

    /// Raises the pending interrupt, or else the pending deferred exception, of the running task.
    pub fn check_interrupt(&self) -> Result<(), Fail> {
        let Some(id) = self.current.get() else {
            return Ok(());
        };
        let mut pool = self.pool.borrow_mut();
        let Some(slot) = pool.get_mut(id) else {
            return Ok(());
        };
        if mem::take(&mut slot.interrupted) {
            return Err(Fail::interrupted());
        }
        match slot.deferred.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Appends the running task to the yielded queue. Returns false outside of a task.
    pub fn yield_current(&self) -> bool {
        let Some(id) = self.current.get() else {
            return false;
        };
        match self.pool.borrow_mut().get_mut(id) {
            Some(slot) => slot.state = TaskState::Yielded,
            None => return false,
        }
        self.yielded.borrow_mut().push_back(id);
        true
    }

    /// Registers `waker` to be woken when a task terminates. Returns false if it already has.
    pub fn register_join(&self, id: TaskId, waker: &Waker) -> bool {
        let mut pool = self.pool.borrow_mut();
        match pool.get_mut(id) {
            Some(slot) => {
                if !slot.join_waiters.iter().any(|w| w.will_wake(waker)) {
                    slot.join_waiters.push(waker.clone());
                }
                true
            },
            None => false,
        }
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.pool.borrow().state(id)
    }

    pub fn task_name(&self, id: TaskId) -> Option<String> {
        self.pool.borrow().get(id).and_then(|slot| slot.name.clone())
    }

    /// Number of tasks that have not terminated.
    pub fn live_tasks(&self) -> usize {
        self.pool.borrow().live()
    }

    pub fn live_task_ids(&self) -> Vec<TaskId> {
        self.pool.borrow().live_ids()
    }

    /// Number of fiber slots, vacant or not.
    pub fn pool_capacity(&self) -> usize {
        self.pool.borrow().capacity()
    }

    /// Takes a task-local value of the running task out of its slot.
    pub fn take_local(&self, index: usize) -> Result<Option<Box<dyn Any>>, Fail> {
        self.with_current_slot(|slot| slot.locals.get_mut(index).and_then(Option::take))
    }

    /// Stores a task-local value of the running task. Returns the value it replaces so that it is dropped by the
    /// caller.
    pub fn put_local(&self, index: usize, value: Option<Box<dyn Any>>) -> Result<Option<Box<dyn Any>>, Fail> {
        self.with_current_slot(|slot| {
            if slot.locals.len() <= index {
                slot.locals.resize_with(index + 1, || None);
            }
            mem::replace(&mut slot.locals[index], value)
        })
    }

    fn with_current_slot<R>(&self, f: impl FnOnce(&mut FiberSlot) -> R) -> Result<R, Fail> {
        let slot_missing = || Fail::new(libc::EPERM, "not running inside a task");
        let id: TaskId = self.current.get().ok_or_else(slot_missing)?;
        let mut pool = self.pool.borrow_mut();
        let slot: &mut FiberSlot = pool.get_mut(id).ok_or_else(slot_missing)?;
        Ok(f(slot))
    }

    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        self.idle_epoch.set(self.idle_epoch.get().wrapping_add(1));
        let old: Option<IdleCallback> = self.idle_callback.replace(callback);
        drop(old);
    }

    /// Runs the idle hook, if any. Returns true if it asked for another pass.
    fn run_idle_callback(&self) -> bool {
        let Some(mut callback) = self.idle_callback.borrow_mut().take() else {
            return false;
        };
        let epoch: u64 = self.idle_epoch.get();
        let again: bool = callback();
        // The hook may have replaced or cleared itself.
        if self.idle_epoch.get() == epoch {
            *self.idle_callback.borrow_mut() = Some(callback);
        }
        again
    }

    fn has_ready_work(&self) -> bool {
        !self.yielded.borrow().is_empty() || !self.inbox.is_empty()
    }

    /// Runs one iteration of the event loop, blocking in the driver if there is nothing to do.
    pub fn run_event_loop_once(&self) -> ExitReason {
        self.schedule();
        if self.inbox.take_exit_request() {
            return ExitReason::Exited;
        }
        let mut ready: bool = self.has_ready_work();
        if !ready {
            ready = self.run_idle_callback() || self.has_ready_work();
            if self.inbox.take_exit_request() {
                return ExitReason::Exited;
            }
        }
        if !ready && self.live_tasks() == 0 && self.driver.pending_timer_count() == 0 {
            // A task may have asked the driver to exit on its way out.
            if self.driver.process_events(Some(Duration::ZERO)) == ExitReason::Exited {
                return ExitReason::Exited;
            }
            return ExitReason::OutOfWaiters;
        }
        let timeout: Option<Duration> = if ready { Some(Duration::ZERO) } else { None };
        let reason: ExitReason = self.driver.process_events(timeout);
        if self.inbox.take_exit_request() {
            return ExitReason::Exited;
        }
        reason
    }

    /// Runs the event loop until an exit is requested or nothing is left to wait for.
    pub fn run_event_loop(&self) -> i32 {
        loop {
            match self.run_event_loop_once() {
                ExitReason::Exited => {
                    trace!("run_event_loop(): exit requested");
                    return 0;
                },
                ExitReason::OutOfWaiters => {
                    trace!("run_event_loop(): out of waiters");
                    return 0;
                },
                ExitReason::Idle | ExitReason::Timeout => (),
            }
        }
    }

    /// Processes whatever is ready without blocking. Returns false once an exit has been requested.
    pub fn process_events(&self) -> bool {
        self.schedule();
        if self.inbox.take_exit_request() {
            return false;
        }
        if self.driver.process_events(Some(Duration::ZERO)) == ExitReason::Exited {
            return false;
        }
        self.schedule();
        !self.inbox.take_exit_request()
    }

    /// Requests the event loop to return. Other threads go through [ThreadInbox::request_exit] instead.
    pub fn exit_event_loop(&self) {
        self.driver.exit_event_loop();
    }
}

impl SharedScheduler {
    pub fn new(driver: Rc<dyn EventDriver>, fiber_pool_size: usize) -> Self {
        Self(Rc::new(Scheduler::new(driver, fiber_pool_size)))
    }
}

impl<'a> CurrentTaskGuard<'a> {
    fn enter(current: &'a Cell<Option<TaskId>>, id: TaskId) -> Self {
        let previous: Option<TaskId> = current.replace(Some(id));
        Self { current, previous }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for CurrentTaskGuard<'_> {
    fn drop(&mut self) {
        self.current.set(self.previous);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
