// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime context.
//!
//! The process-wide [RuntimeContext] holds the configuration and the shared worker pool. Each thread lazily gets its
//! own scheduler the first time it needs one; every scheduler registers its inbox so that all event loops can be asked
//! to exit at once.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    config::Config,
    driver::{
        EventDriver,
        GenericDriver,
    },
    fail::Fail,
    limits,
    logging,
    scheduler::{
        SharedScheduler,
        TaskId,
        TaskOwner,
        ThreadInbox,
    },
    worker::{
        Job,
        WorkerPool,
    },
};
use ::parking_lot::{
    const_mutex,
    Mutex,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        Arc,
        Weak,
    },
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

enum WorkersState {
    /// Not started yet. Started by the first submission.
    Idle,
    Running(WorkerPool),
    Stopped,
}

/// Process-wide runtime settings and services.
pub struct RuntimeContext {
    config: Config,
    fiber_pool_size: usize,
    worker_threads: usize,
    workers: Mutex<WorkersState>,
}

//======================================================================================================================
// Static Variables
//======================================================================================================================

static RUNTIME: Mutex<Option<Arc<RuntimeContext>>> = const_mutex(None);

/// Inboxes of every thread that created a scheduler.
static THREAD_REGISTRY: Mutex<Vec<Weak<ThreadInbox>>> = const_mutex(Vec::new());

thread_local! {
    static THREAD_SCHEDULER: RefCell<Option<SharedScheduler>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RuntimeContext {
    fn new(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            config: config.clone(),
            fiber_pool_size: config.fiber_pool_size()?,
            worker_threads: config.worker_threads()?,
            workers: Mutex::new(WorkersState::Idle),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fiber_pool_size(&self) -> usize {
        self.fiber_pool_size
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Hands a job to the shared worker threads, starting them on first use.
    pub fn submit(&self, job: Job) -> Result<(), Fail> {
        let mut workers = self.workers.lock();
        if let WorkersState::Idle = *workers {
            *workers = WorkersState::Running(WorkerPool::start(self.worker_threads)?);
        }
        match &*workers {
            WorkersState::Running(pool) => pool.submit(job),
            _ => Err(Fail::new(libc::ESHUTDOWN, "worker pool was stopped")),
        }
    }

    fn stop_workers(&self) {
        let state: WorkersState = ::std::mem::replace(&mut *self.workers.lock(), WorkersState::Stopped);
        if let WorkersState::Running(pool) = state {
            pool.stop();
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Installs the process-wide runtime context.
pub fn initialize(config: &Config) -> Result<(), Fail> {
    logging::initialize_with(&config.log_level()?);
    let context: RuntimeContext = RuntimeContext::new(config)?;
    let mut runtime = RUNTIME.lock();
    if runtime.is_some() {
        let cause: &str = "runtime is already initialized";
        error!("initialize(): {}", cause);
        return Err(Fail::new(libc::EEXIST, cause));
    }
    *runtime = Some(Arc::new(context));
    Ok(())
}

/// Stops the worker threads and removes the process-wide runtime context. Must not be called from a worker thread.
pub fn shutdown() {
    let context: Option<Arc<RuntimeContext>> = RUNTIME.lock().take();
    if let Some(context) = context {
        context.stop_workers();
    }
}

pub fn runtime() -> Option<Arc<RuntimeContext>> {
    RUNTIME.lock().clone()
}

/// Returns the runtime context, installing one with the default configuration if there is none.
pub fn runtime_or_default() -> Result<Arc<RuntimeContext>, Fail> {
    let mut runtime = RUNTIME.lock();
    if let Some(context) = runtime.as_ref() {
        return Ok(context.clone());
    }
    let context: Arc<RuntimeContext> = Arc::new(RuntimeContext::new(&Config::default())?);
    *runtime = Some(context.clone());
    Ok(context)
}

fn create_scheduler(driver: Rc<dyn EventDriver>) -> SharedScheduler {
    logging::initialize();
    let fiber_pool_size: usize = runtime().map_or(limits::FIBER_POOL_SIZE_DEFAULT, |context| context.fiber_pool_size());
    let scheduler: SharedScheduler = SharedScheduler::new(driver, fiber_pool_size);
    let mut registry = THREAD_REGISTRY.lock();
    registry.retain(|inbox: &Weak<ThreadInbox>| inbox.strong_count() > 0);
    registry.push(Arc::downgrade(scheduler.inbox()));
    trace!("create_scheduler(): thread={:?} fiber_pool_size={}", thread::current().id(), fiber_pool_size);
    scheduler
}

/// Returns the scheduler of the calling thread, creating one on top of a [GenericDriver] if needed.
pub fn current_scheduler() -> Result<SharedScheduler, Fail> {
    THREAD_SCHEDULER
        .try_with(|slot: &RefCell<Option<SharedScheduler>>| {
            if let Some(scheduler) = slot.borrow().as_ref() {
                return scheduler.clone();
            }
            let scheduler: SharedScheduler = create_scheduler(Rc::new(GenericDriver::new()));
            *slot.borrow_mut() = Some(scheduler.clone());
            scheduler
        })
        .map_err(|_| Fail::new(libc::ESHUTDOWN, "thread is exiting"))
}

/// Returns the scheduler of the calling thread, if it has one.
pub fn try_current_scheduler() -> Option<SharedScheduler> {
    THREAD_SCHEDULER
        .try_with(|slot: &RefCell<Option<SharedScheduler>>| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Sets up the calling thread's scheduler on top of `driver`.
pub fn initialize_thread(driver: Rc<dyn EventDriver>) -> Result<(), Fail> {
    THREAD_SCHEDULER
        .try_with(|slot: &RefCell<Option<SharedScheduler>>| {
            if slot.borrow().is_some() {
                let cause: &str = "thread already has a scheduler";
                error!("initialize_thread(): {}", cause);
                return Err(Fail::new(libc::EEXIST, cause));
            }
            *slot.borrow_mut() = Some(create_scheduler(driver));
            Ok(())
        })
        .map_err(|_| Fail::new(libc::ESHUTDOWN, "thread is exiting"))?
}

/// Drops the calling thread's scheduler together with the tasks it still holds.
pub fn teardown_thread() {
    let scheduler: Option<SharedScheduler> = THREAD_SCHEDULER
        .try_with(|slot: &RefCell<Option<SharedScheduler>>| slot.borrow_mut().take())
        .ok()
        .flatten();
    if let Some(scheduler) = scheduler {
        let unfinished: Vec<TaskId> = scheduler.live_task_ids();
        if !unfinished.is_empty() {
            debug!("teardown_thread(): dropping unfinished tasks {:?}", unfinished);
        }
        drop(scheduler);
    }
}

/// Running task of the calling thread, if any.
pub fn current_task_id() -> Option<TaskId> {
    try_current_scheduler().and_then(|scheduler| scheduler.current_task())
}

/// Running task of the calling thread, qualified with the thread.
pub fn current_owner() -> Option<TaskOwner> {
    current_task_id().map(|task: TaskId| TaskOwner {
        thread: thread::current().id(),
        task,
    })
}

/// Inboxes of all threads whose scheduler is still alive.
pub fn registered_inboxes() -> Vec<Arc<ThreadInbox>> {
    THREAD_REGISTRY.lock().iter().filter_map(Weak::upgrade).collect()
}
