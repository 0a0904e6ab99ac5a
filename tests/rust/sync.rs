// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fibercore::{
    ensure_eq,
    runtime,
    Fail,
    LocalTaskSemaphore,
    ManualEvent,
    TaskHandle,
    TaskMutex,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Events
//======================================================================================================================

/// A task emits after sleeping; a waiter on the same thread observes the emission once the sleep is over.
#[test]
fn waiter_observes_emit_after_sleep() -> Result<()> {
    let event: Arc<ManualEvent> = Arc::new(ManualEvent::new());
    let observed: Rc<Cell<Option<(u32, Duration)>>> = Rc::new(Cell::new(None));
    let start: Instant = Instant::now();

    let event_: Arc<ManualEvent> = event.clone();
    let observed_: Rc<Cell<Option<(u32, Duration)>>> = observed.clone();
    runtime::spawn(move || async move {
        let count: u32 = event_.wait(0).await?;
        observed_.set(Some((count, start.elapsed())));
        Ok(())
    })?;

    let event_: Arc<ManualEvent> = event.clone();
    runtime::spawn(move || async move {
        runtime::sleep(Duration::from_millis(50)).await?;
        event_.emit();
        Ok(())
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    let (count, elapsed): (u32, Duration) = observed
        .get()
        .ok_or_else(|| anyhow::anyhow!("waiter never resumed"))?;
    ensure_eq!(count, 1);
    ensure_eq!(elapsed >= Duration::from_millis(50), true);
    runtime::teardown_thread();
    Ok(())
}

/// Emissions from another thread are never lost, however they interleave with the waiter.
#[test]
fn cross_thread_emissions_are_not_lost() -> Result<()> {
    const ROUNDS: u32 = 200;
    let event: Arc<ManualEvent> = Arc::new(ManualEvent::new());
    let produced: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let timeouts: Rc<Cell<u32>> = Rc::new(Cell::new(0));

    let event_: Arc<ManualEvent> = event.clone();
    let produced_: Arc<AtomicU32> = produced.clone();
    let timeouts_: Rc<Cell<u32>> = timeouts.clone();
    runtime::spawn(move || async move {
        loop {
            let count: u32 = event_.emit_count();
            if produced_.load(Ordering::SeqCst) == ROUNDS {
                return Ok(());
            }
            let next: u32 = event_.wait_timeout(Duration::from_secs(5), count).await?;
            if next == count {
                timeouts_.set(timeouts_.get() + 1);
                return Ok(());
            }
        }
    })?;

    let event_: Arc<ManualEvent> = event.clone();
    let producer = thread::spawn(move || {
        let mut rng: SmallRng = SmallRng::seed_from_u64(42);
        for _ in 0..ROUNDS {
            produced.fetch_add(1, Ordering::SeqCst);
            event_.emit();
            // Vary the interleaving with the waiter.
            if rng.gen_bool(0.25) {
                thread::yield_now();
            }
        }
    });

    ensure_eq!(runtime::run_event_loop()?, 0);
    producer.join().map_err(|_| anyhow::anyhow!("producer panicked"))?;
    ensure_eq!(timeouts.get(), 0);
    ensure_eq!(event.emit_count(), ROUNDS);
    ensure_eq!(event.waiter_count(), 0);
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Mutex
//======================================================================================================================

/// The second task only gets the lock once the first one, sleeping with it, lets go.
#[test]
fn mutex_excludes_across_suspension() -> Result<()> {
    let mutex: Rc<TaskMutex> = Rc::new(TaskMutex::new());
    let trace: Rc<RefCell<Vec<(&'static str, Duration)>>> = Rc::new(RefCell::new(Vec::new()));
    let start: Instant = Instant::now();

    for (name, delay) in [("first", 20), ("second", 0)] {
        let mutex_: Rc<TaskMutex> = mutex.clone();
        let trace_: Rc<RefCell<Vec<(&'static str, Duration)>>> = trace.clone();
        runtime::spawn(move || async move {
            let guard = mutex_.lock().await?;
            trace_.borrow_mut().push((name, start.elapsed()));
            runtime::sleep(Duration::from_millis(delay)).await?;
            drop(guard);
            Ok(())
        })?;
    }

    ensure_eq!(runtime::run_event_loop()?, 0);
    let trace: Vec<(&'static str, Duration)> = trace.borrow().clone();
    ensure_eq!(trace.iter().map(|(name, _)| *name).collect::<Vec<_>>(), vec!["first", "second"]);
    ensure_eq!(trace[1].1 >= Duration::from_millis(20), true);
    ensure_eq!(mutex.is_locked(), false);
    runtime::teardown_thread();
    Ok(())
}

/// Interrupting a task blocked in lock() fails the lock there and leaves no trace in the mutex.
#[test]
fn interrupted_lock_leaves_no_residue() -> Result<()> {
    let mutex: Rc<TaskMutex> = Rc::new(TaskMutex::new());
    let outcome: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));

    let mutex_: Rc<TaskMutex> = mutex.clone();
    runtime::spawn(move || async move {
        let guard = mutex_.lock().await?;
        runtime::sleep(Duration::from_millis(30)).await?;
        drop(guard);
        Ok(())
    })?;

    let mutex_: Rc<TaskMutex> = mutex.clone();
    let outcome_: Rc<Cell<Option<i32>>> = outcome.clone();
    let blocked: TaskHandle = runtime::spawn(move || async move {
        outcome_.set(mutex_.lock().await.err().map(|e| e.errno));
        Ok(())
    })?;
    ensure_eq!(mutex.waiter_count(), 1);

    blocked.interrupt();
    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(outcome.get(), Some(libc::ECANCELED));
    ensure_eq!(mutex.waiter_count(), 0);
    ensure_eq!(mutex.is_locked(), false);
    runtime::teardown_thread();
    Ok(())
}

/// Tasks of two threads increment a counter under the mutex, yielding inside the critical section.
#[test]
fn mutex_serializes_tasks_of_different_threads() -> Result<()> {
    const ITERATIONS: u32 = 50;
    let mutex: Arc<TaskMutex> = Arc::new(TaskMutex::new());
    let counter: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));

    let run = |mutex: Arc<TaskMutex>, counter: Arc<AtomicU32>| -> Result<i32, Fail> {
        runtime::spawn(move || async move {
            for _ in 0..ITERATIONS {
                let guard = mutex.lock().await?;
                let value: u32 = counter.load(Ordering::SeqCst);
                runtime::yield_now().await?;
                counter.store(value + 1, Ordering::SeqCst);
                drop(guard);
            }
            Ok(())
        })?;
        let code: i32 = runtime::run_event_loop()?;
        runtime::teardown_thread();
        Ok(code)
    };

    let (mutex_, counter_): (Arc<TaskMutex>, Arc<AtomicU32>) = (mutex.clone(), counter.clone());
    let other = thread::spawn(move || run(mutex_, counter_));
    ensure_eq!(run(mutex.clone(), counter.clone())?, 0);
    ensure_eq!(other.join().map_err(|_| anyhow::anyhow!("thread panicked"))??, 0);
    ensure_eq!(counter.load(Ordering::SeqCst), 2 * ITERATIONS);
    ensure_eq!(mutex.is_locked(), false);
    Ok(())
}

//======================================================================================================================
// Semaphore
//======================================================================================================================

/// No more than `max_locks` tasks hold the semaphore at once, and every task gets through.
#[test]
fn semaphore_bounds_concurrent_holders() -> Result<()> {
    let semaphore: Rc<LocalTaskSemaphore> = Rc::new(LocalTaskSemaphore::new(2));
    let active: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let peak: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let done: Rc<Cell<usize>> = Rc::new(Cell::new(0));

    for i in 0..6u64 {
        let semaphore_: Rc<LocalTaskSemaphore> = semaphore.clone();
        let active_: Rc<Cell<usize>> = active.clone();
        let peak_: Rc<Cell<usize>> = peak.clone();
        let done_: Rc<Cell<usize>> = done.clone();
        runtime::spawn(move || async move {
            semaphore_.lock(0).await?;
            active_.set(active_.get() + 1);
            peak_.set(peak_.get().max(active_.get()));
            runtime::sleep(Duration::from_millis(2 + i)).await?;
            active_.set(active_.get() - 1);
            done_.set(done_.get() + 1);
            semaphore_.unlock()
        })?;
    }

    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(peak.get(), 2);
    ensure_eq!(done.get(), 6);
    ensure_eq!(semaphore.available(), 2);
    runtime::teardown_thread();
    Ok(())
}

/// A released slot goes to the earliest waiter, unless a waiter with enough priority arrived since.
#[test]
fn semaphore_hands_off_by_sequence_and_priority() -> Result<()> {
    let semaphore: Rc<LocalTaskSemaphore> = Rc::new(LocalTaskSemaphore::new(1));
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    ensure_eq!(semaphore.try_lock(), true);

    for (name, priority) in [("early", 0), ("late", 0), ("urgent", 1), ("latest", 0)] {
        let semaphore_: Rc<LocalTaskSemaphore> = semaphore.clone();
        let order_: Rc<RefCell<Vec<&'static str>>> = order.clone();
        runtime::spawn(move || async move {
            semaphore_.lock(priority).await?;
            order_.borrow_mut().push(name);
            semaphore_.unlock()
        })?;
    }

    semaphore.unlock()?;
    ensure_eq!(runtime::run_event_loop()?, 0);
    // "urgent" arrived third, but its priority moves it ahead of "late".
    ensure_eq!(order.borrow().clone(), vec!["early", "urgent", "late", "latest"]);
    runtime::teardown_thread();
    Ok(())
}
