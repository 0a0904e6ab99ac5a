// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared worker threads.
//!
//! Each worker thread runs its own scheduler. A long-lived task on every worker drains the job queue and turns each job
//! into a task of that worker.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    self,
    fail::Fail,
    sync::ManualEvent,
};
use ::parking_lot::Mutex;
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Unit of work handed to a worker thread. Runs on the worker, usually spawning a task there.
pub type Job = Box<dyn FnOnce() -> Result<(), Fail> + Send>;

struct WorkerShared {
    queue: Mutex<VecDeque<Job>>,
    /// Emitted on every submission and on shutdown.
    signal: ManualEvent,
    shutdown: AtomicBool,
}

/// Fixed set of worker threads consuming a shared FIFO queue.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    threads: Vec<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkerShared {
    fn pop(&self) -> Option<Job> {
        self.queue.lock().pop_front()
    }

    /// Body of the task that serves jobs on a worker thread.
    async fn serve(self: Arc<Self>) -> Result<(), Fail> {
        loop {
            // Capture before draining, so that a submission racing with the drain still wakes us up.
            let count: u32 = self.signal.emit_count();
            while let Some(job) = self.pop() {
                if let Err(e) = job() {
                    warn!("serve(): job failed ({:?})", e);
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                trace!("serve(): worker {:?} shutting down", thread::current().name());
                return runtime::exit_event_loop();
            }
            self.signal.wait_uninterruptible(count).await;
        }
    }
}

impl WorkerPool {
    /// Starts `size` worker threads.
    pub fn start(size: usize) -> Result<Self, Fail> {
        let shared: Arc<WorkerShared> = Arc::new(WorkerShared {
            queue: Mutex::new(VecDeque::new()),
            signal: ManualEvent::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut pool: WorkerPool = Self {
            shared,
            threads: Vec::with_capacity(size),
        };
        for i in 0..size {
            let shared: Arc<WorkerShared> = pool.shared.clone();
            let builder: thread::Builder = thread::Builder::new().name(format!("fibercore-worker-{}", i));
            match builder.spawn(move || Self::run(shared)) {
                Ok(handle) => pool.threads.push(handle),
                Err(e) => {
                    let cause: String = format!("failed to start worker thread {} ({:?})", i, e);
                    error!("start(): {}", cause);
                    pool.stop();
                    return Err(Fail::new(libc::EAGAIN, &cause));
                },
            }
        }
        debug!("start(): {} worker threads", size);
        Ok(pool)
    }

    fn run(shared: Arc<WorkerShared>) {
        if let Err(e) = runtime::spawn_named("worker", move || shared.serve()) {
            error!("run(): failed to start serving task ({:?})", e);
            return;
        }
        if let Err(e) = runtime::run_event_loop() {
            error!("run(): event loop failed ({:?})", e);
        }
        runtime::teardown_thread();
    }

    /// Queues a job and wakes the workers.
    pub fn submit(&self, job: Job) -> Result<(), Fail> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            let cause: &str = "worker pool was stopped";
            error!("submit(): {}", cause);
            return Err(Fail::new(libc::ESHUTDOWN, cause));
        }
        self.shared.queue.lock().push_back(job);
        self.shared.signal.emit();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Asks every worker to exit after draining the queue, and waits for them.
    pub fn stop(self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.signal.emit();
        for handle in self.threads {
            if let Err(e) = handle.join() {
                warn!("stop(): worker thread panicked ({:?})", e);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
