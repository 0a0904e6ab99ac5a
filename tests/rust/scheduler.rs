// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::fibercore::{
    ensure_eq,
    ensure_neq,
    runtime::{
        self,
        driver::ExitReason,
    },
    Fail,
    LocalManualEvent,
    ManualEvent,
    TaskHandle,
    TaskLocal,
    TaskState,
    Yielder,
    YielderHandle,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Helpers
//======================================================================================================================

/// Spawns a task that waits on `event` and then finishes.
fn spawn_waiter(event: &LocalManualEvent) -> Result<TaskHandle, Fail> {
    let event: LocalManualEvent = event.clone();
    runtime::spawn(move || async move {
        event.wait(0).await?;
        Ok(())
    })
}

//======================================================================================================================
// Task Identity
//======================================================================================================================

#[test]
fn task_ids_are_unique_and_stale_handles_never_alias() -> Result<()> {
    let event: LocalManualEvent = LocalManualEvent::new();
    let handles: Vec<TaskHandle> = (0..3).map(|_| spawn_waiter(&event)).collect::<Result<_, Fail>>()?;
    for (i, a) in handles.iter().enumerate() {
        ensure_eq!(a.state()?, TaskState::WaitingOnEvent);
        for b in handles.iter().skip(i + 1) {
            ensure_neq!(a.id(), b.id());
        }
    }

    event.emit();
    ensure_eq!(runtime::run_event_loop()?, 0);
    for handle in &handles {
        ensure_eq!(handle.state()?, TaskState::Terminated);
        ensure_eq!(handle.is_running()?, false);
    }

    // A new task reuses one of the freed slots under a new generation.
    let fresh: TaskHandle = spawn_waiter(&LocalManualEvent::new())?;
    for handle in &handles {
        ensure_neq!(*handle, fresh);
        ensure_eq!(handle.state()?, TaskState::Terminated);
    }
    ensure_eq!(fresh.state()?, TaskState::WaitingOnEvent);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn oversized_closure_is_rejected() -> Result<()> {
    let payload: [u8; 1024] = [7; 1024];
    let result: Result<TaskHandle, Fail> = runtime::spawn(move || async move {
        let _sum: u32 = payload.iter().map(|b| *b as u32).sum();
        Ok(())
    });
    ensure_eq!(result.map(|_| ()).map_err(|e| e.errno), Err(libc::E2BIG));

    // Boxing the capture keeps the closure small.
    let payload: Box<[u8; 1024]> = Box::new([7; 1024]);
    let result: Result<TaskHandle, Fail> = runtime::spawn(move || async move {
        let _sum: u32 = payload.iter().map(|b| *b as u32).sum();
        Ok(())
    });
    ensure_eq!(result.is_ok(), true);
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Join
//======================================================================================================================

#[test]
fn join_waits_for_the_target() -> Result<()> {
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let order_: Rc<RefCell<Vec<&'static str>>> = order.clone();
    let sleeper: TaskHandle = runtime::spawn_named("sleeper", move || async move {
        runtime::sleep(Duration::from_millis(10)).await?;
        order_.borrow_mut().push("sleeper");
        Ok(())
    })?;

    let order_: Rc<RefCell<Vec<&'static str>>> = order.clone();
    let target: TaskHandle = sleeper.clone();
    runtime::spawn(move || async move {
        target.join().await?;
        order_.borrow_mut().push("joiner");
        // Joining a finished task returns right away.
        target.join().await?;
        Ok(())
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(order.borrow().clone(), vec!["sleeper", "joiner"]);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn join_rejects_self_and_foreign_tasks() -> Result<()> {
    let errno: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
    let errno_: Rc<Cell<Option<i32>>> = errno.clone();
    runtime::spawn(move || async move {
        if let Some(me) = runtime::current_task() {
            errno_.set(me.join().await.err().map(|e| e.errno));
        }
        Ok(())
    })?;
    ensure_eq!(errno.get(), Some(libc::EDEADLK));

    let local: TaskHandle = spawn_waiter(&LocalManualEvent::new())?;
    let (tx, rx): (Sender<Option<i32>>, Receiver<Option<i32>>) = crossbeam_channel::bounded(1);
    let other = thread::spawn(move || {
        let result: Result<TaskHandle, Fail> = runtime::spawn(move || async move {
            let errno: Option<i32> = local.join().await.err().map(|e| e.errno);
            tx.send(errno).map_err(|_| Fail::new(libc::EPIPE, "receiver is gone"))
        });
        runtime::teardown_thread();
        result.map(|_| ())
    });
    ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, Some(libc::EPERM));
    ensure_eq!(other.join().map_err(|_| anyhow::anyhow!("thread panicked"))?.is_ok(), true);
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Interrupts
//======================================================================================================================

#[test]
fn interrupt_is_raised_at_the_next_suspension() -> Result<()> {
    let outcome: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
    let outcome_: Rc<Cell<Option<i32>>> = outcome.clone();
    let handle: TaskHandle = runtime::spawn(move || async move {
        outcome_.set(runtime::sleep(Duration::from_secs(10)).await.err().map(|e| e.errno));
        Ok(())
    })?;
    handle.interrupt();

    let start: Instant = Instant::now();
    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(outcome.get(), Some(libc::ECANCELED));
    ensure_eq!(start.elapsed() < Duration::from_secs(5), true);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn interrupt_stops_a_yielding_loop() -> Result<()> {
    let iterations: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let outcome: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));

    let iterations_: Rc<Cell<u32>> = iterations.clone();
    let outcome_: Rc<Cell<Option<i32>>> = outcome.clone();
    let handle: TaskHandle = runtime::spawn(move || async move {
        for _ in 0..100 {
            if let Err(e) = runtime::yield_now().await {
                outcome_.set(Some(e.errno));
                return Ok(());
            }
            iterations_.set(iterations_.get() + 1);
        }
        Ok(())
    })?;
    // The task is parked in its first yield.
    handle.interrupt();

    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(outcome.get(), Some(libc::ECANCELED));
    ensure_eq!(iterations.get(), 0);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn interrupt_from_another_thread_wakes_the_task() -> Result<()> {
    let event: Arc<ManualEvent> = Arc::new(ManualEvent::new());
    let outcome: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));

    let event_: Arc<ManualEvent> = event.clone();
    let outcome_: Rc<Cell<Option<i32>>> = outcome.clone();
    let handle: TaskHandle = runtime::spawn(move || async move {
        outcome_.set(event_.wait(0).await.err().map(|e| e.errno));
        Ok(())
    })?;

    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        handle.interrupt();
    });
    ensure_eq!(runtime::run_event_loop()?, 0);
    interrupter.join().map_err(|_| anyhow::anyhow!("thread panicked"))?;
    ensure_eq!(outcome.get(), Some(libc::ECANCELED));
    ensure_eq!(event.waiter_count(), 0);
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Yielder
//======================================================================================================================

#[test]
fn yielder_resumes_with_the_delivered_result() -> Result<()> {
    let handle: Rc<RefCell<Option<YielderHandle>>> = Rc::new(RefCell::new(None));
    let results: Rc<RefCell<Vec<Result<(), i32>>>> = Rc::new(RefCell::new(Vec::new()));

    let handle_: Rc<RefCell<Option<YielderHandle>>> = handle.clone();
    let results_: Rc<RefCell<Vec<Result<(), i32>>>> = results.clone();
    runtime::spawn(move || async move {
        let yielder: Yielder = Yielder::new();
        *handle_.borrow_mut() = Some(yielder.get_handle());
        for _ in 0..2 {
            let result: Result<(), i32> = yielder.yield_until_wake().await.map_err(|e| e.errno);
            results_.borrow_mut().push(result);
        }
        Ok(())
    })?;

    let remote: YielderHandle = handle
        .borrow()
        .clone()
        .ok_or_else(|| anyhow::anyhow!("task did not publish its handle"))?;
    ensure_eq!(remote.is_waiting(), true);
    remote.wake_with(Ok(()));
    ensure_eq!(runtime::process_events()?, true);

    // A failure delivered from another thread reaches the task through its inbox.
    let sender = thread::spawn(move || remote.wake_with(Err(Fail::new(libc::ECONNRESET, "peer went away"))));
    sender.join().map_err(|_| anyhow::anyhow!("thread panicked"))?;
    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(results.borrow().clone(), vec![Ok(()), Err(libc::ECONNRESET)]);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn failure_for_a_busy_task_is_deferred() -> Result<()> {
    let handle: Rc<RefCell<Option<YielderHandle>>> = Rc::new(RefCell::new(None));
    let outcome: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));

    let handle_: Rc<RefCell<Option<YielderHandle>>> = handle.clone();
    let outcome_: Rc<Cell<Option<i32>>> = outcome.clone();
    runtime::spawn(move || async move {
        let yielder: Yielder = Yielder::new();
        *handle_.borrow_mut() = Some(yielder.get_handle());
        // The failure is delivered while this task is not waiting for it, and raised once the yield resumes.
        outcome_.set(runtime::yield_now().await.err().map(|e| e.errno));
        Ok(())
    })?;

    if let Some(remote) = handle.borrow().as_ref() {
        remote.wake_with(Err(Fail::new(libc::EBADF, "descriptor closed")));
    }
    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(outcome.get(), Some(libc::EBADF));
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Task-Local Storage
//======================================================================================================================

static REQUEST_ID: TaskLocal<u64> = TaskLocal::new();

#[test]
fn task_locals_are_private_to_each_task() -> Result<()> {
    let seen: Rc<RefCell<Vec<Option<u64>>>> = Rc::new(RefCell::new(Vec::new()));
    for id in [11, 22] {
        let seen_: Rc<RefCell<Vec<Option<u64>>>> = seen.clone();
        runtime::spawn(move || async move {
            REQUEST_ID.set(id)?;
            runtime::yield_now().await?;
            seen_.borrow_mut().push(REQUEST_ID.get()?);
            Ok(())
        })?;
    }
    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(seen.borrow().clone(), vec![Some(11), Some(22)]);

    // A task reusing a slot starts out empty.
    let seen_: Rc<RefCell<Vec<Option<u64>>>> = seen.clone();
    runtime::spawn(move || async move {
        seen_.borrow_mut().push(REQUEST_ID.take()?);
        Ok(())
    })?;
    ensure_eq!(seen.borrow().last().copied(), Some(None));

    ensure_eq!(REQUEST_ID.get().map_err(|e| e.errno), Err(libc::EPERM));
    runtime::teardown_thread();
    Ok(())
}

//======================================================================================================================
// Event Loop
//======================================================================================================================

#[test]
fn exit_handle_stops_the_loop_from_another_thread() -> Result<()> {
    let _waiter: TaskHandle = spawn_waiter(&LocalManualEvent::new())?;
    let exit = runtime::exit_handle()?;
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        exit.exit_event_loop();
    });

    ensure_eq!(runtime::run_event_loop()?, 0);
    stopper.join().map_err(|_| anyhow::anyhow!("thread panicked"))?;
    ensure_eq!(runtime::process_events()?, true);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn process_events_reports_exit_once() -> Result<()> {
    ensure_eq!(runtime::process_events()?, true);
    // Repeated requests collapse into one.
    runtime::exit_event_loop()?;
    runtime::exit_event_loop()?;
    ensure_eq!(runtime::process_events()?, false);
    ensure_eq!(runtime::process_events()?, true);
    ensure_eq!(runtime::run_event_loop_once()?, ExitReason::OutOfWaiters);
    runtime::teardown_thread();
    Ok(())
}

#[test]
fn idle_callback_runs_after_ready_work() -> Result<()> {
    let trace: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let trace_: Rc<RefCell<Vec<&'static str>>> = trace.clone();
    runtime::spawn(move || async move {
        runtime::yield_now().await?;
        trace_.borrow_mut().push("task");
        Ok(())
    })?;

    let trace_: Rc<RefCell<Vec<&'static str>>> = trace.clone();
    runtime::set_idle_callback(move || {
        trace_.borrow_mut().push("idle");
        false
    })?;
    ensure_eq!(runtime::run_event_loop()?, 0);
    runtime::clear_idle_callback()?;
    ensure_eq!(trace.borrow().first().copied(), Some("task"));
    ensure_eq!(trace.borrow().contains(&"idle"), true);
    runtime::teardown_thread();
    Ok(())
}
