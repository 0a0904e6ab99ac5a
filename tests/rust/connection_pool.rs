// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fibercore::{
    ensure_eq,
    runtime,
    ConnectionPool,
    Fail,
    LockedConnection,
    PoolResource,
    TaskHandle,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Connection whose creation takes a while, like a real handshake.
struct SlowConnection {
    requests: u32,
}

impl PoolResource for SlowConnection {}

//======================================================================================================================
// Helpers
//======================================================================================================================

fn slow_pool(max_concurrency: usize) -> ConnectionPool<SlowConnection> {
    ConnectionPool::new(
        || async {
            runtime::sleep(Duration::from_millis(1)).await?;
            Ok(SlowConnection { requests: 0 })
        },
        max_concurrency,
    )
}

/// Fails unless the connection has served `expected` requests.
fn ensure_requests(connection: &LockedConnection<SlowConnection>, expected: u32) -> Result<(), Fail> {
    let requests: u32 = connection.get()?.requests;
    if requests != expected {
        return Err(Fail::new(libc::EINVAL, "connection was not reused"));
    }
    Ok(())
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// With a single slot, the second acquirer waits until every copy of the first checkout is gone.
#[test]
fn second_acquire_waits_for_the_last_copy() -> Result<()> {
    let pool: ConnectionPool<SlowConnection> = slow_pool(1);
    let start: Instant = Instant::now();
    let second: Rc<Cell<Option<(u64, Duration)>>> = Rc::new(Cell::new(None));

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    runtime::spawn(move || async move {
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        let copy: LockedConnection<SlowConnection> = connection.clone();
        runtime::sleep(Duration::from_millis(20)).await?;
        drop(connection);
        runtime::sleep(Duration::from_millis(20)).await?;
        copy.get_mut()?.requests += 1;
        Ok(())
    })?;

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    let second_: Rc<Cell<Option<(u64, Duration)>>> = second.clone();
    runtime::spawn(move || async move {
        // Let the first task reach the pool first.
        runtime::yield_now().await?;
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        second_.set(Some((connection.id(), start.elapsed())));
        ensure_requests(&connection, 1)
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    let (id, elapsed): (u64, Duration) = second.get().ok_or_else(|| anyhow::anyhow!("second task never ran"))?;
    ensure_eq!(id, 0);
    ensure_eq!(elapsed >= Duration::from_millis(40), true);
    ensure_eq!(pool.connection_count(), 1);
    ensure_eq!(pool.active_count(), 0);
    runtime::teardown_thread();
    Ok(())
}

/// Nested copies hold one slot between them, released exactly once.
#[test]
fn nested_copies_release_the_slot_once() -> Result<()> {
    let pool: ConnectionPool<SlowConnection> = slow_pool(2);
    let snapshots: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    let snapshots_: Rc<RefCell<Vec<usize>>> = snapshots.clone();
    runtime::spawn(move || async move {
        let outer: LockedConnection<SlowConnection> = pool_.acquire().await?;
        {
            let inner: LockedConnection<SlowConnection> = outer.clone();
            let innermost: LockedConnection<SlowConnection> = inner.clone();
            inner.validate()?;
            drop(innermost);
            snapshots_.borrow_mut().push(pool_.active_count());
        }
        snapshots_.borrow_mut().push(pool_.active_count());
        drop(outer);
        snapshots_.borrow_mut().push(pool_.active_count());

        // Both slots are free again.
        let a: LockedConnection<SlowConnection> = pool_.acquire().await?;
        let b: LockedConnection<SlowConnection> = pool_.acquire().await?;
        snapshots_.borrow_mut().push(pool_.active_count());
        drop((a, b));
        Ok(())
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(snapshots.borrow().clone(), vec![1, 1, 0, 2]);
    ensure_eq!(pool.connection_count(), 2);
    runtime::teardown_thread();
    Ok(())
}

/// Raising the concurrency limit admits a task that is waiting for a slot.
#[test]
fn raising_max_concurrency_admits_waiters() -> Result<()> {
    let pool: ConnectionPool<SlowConnection> = slow_pool(1);
    let start: Instant = Instant::now();
    let admitted: Rc<Cell<Option<Duration>>> = Rc::new(Cell::new(None));

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    runtime::spawn(move || async move {
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        runtime::sleep(Duration::from_millis(100)).await?;
        drop(connection);
        Ok(())
    })?;

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    let admitted_: Rc<Cell<Option<Duration>>> = admitted.clone();
    runtime::spawn(move || async move {
        runtime::yield_now().await?;
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        admitted_.set(Some(start.elapsed()));
        drop(connection);
        Ok(())
    })?;

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    runtime::spawn(move || async move {
        runtime::sleep(Duration::from_millis(10)).await?;
        pool_.set_max_concurrency(2);
        Ok(())
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    let elapsed: Duration = admitted.get().ok_or_else(|| anyhow::anyhow!("waiter was never admitted"))?;
    ensure_eq!(elapsed >= Duration::from_millis(10), true);
    ensure_eq!(elapsed < Duration::from_millis(100), true);
    ensure_eq!(pool.max_concurrency(), 2);
    ensure_eq!(pool.connection_count(), 2);
    runtime::teardown_thread();
    Ok(())
}

/// Interrupting a task that waits for a slot fails its acquire there, and the slot goes to the next waiter.
#[test]
fn interrupted_acquire_checks_nothing_out() -> Result<()> {
    let pool: ConnectionPool<SlowConnection> = slow_pool(1);
    let outcome: Rc<Cell<Option<Result<u64, i32>>>> = Rc::new(Cell::new(None));
    let next: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(None));

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    runtime::spawn(move || async move {
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        runtime::sleep(Duration::from_millis(30)).await?;
        drop(connection);
        Ok(())
    })?;

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    let outcome_: Rc<Cell<Option<Result<u64, i32>>>> = outcome.clone();
    let blocked: TaskHandle = runtime::spawn(move || async move {
        runtime::yield_now().await?;
        let result: Result<LockedConnection<SlowConnection>, Fail> = pool_.acquire().await;
        outcome_.set(Some(result.map(|connection| connection.id()).map_err(|e| e.errno)));
        Ok(())
    })?;

    let pool_: ConnectionPool<SlowConnection> = pool.clone();
    let next_: Rc<Cell<Option<u64>>> = next.clone();
    runtime::spawn(move || async move {
        runtime::sleep(Duration::from_millis(10)).await?;
        let connection: LockedConnection<SlowConnection> = pool_.acquire().await?;
        next_.set(Some(connection.id()));
        Ok(())
    })?;

    let interrupter: TaskHandle = blocked.clone();
    runtime::spawn(move || async move {
        runtime::sleep(Duration::from_millis(5)).await?;
        interrupter.interrupt();
        Ok(())
    })?;

    ensure_eq!(runtime::run_event_loop()?, 0);
    ensure_eq!(outcome.get(), Some(Err(libc::ECANCELED)));
    ensure_eq!(next.get(), Some(0));
    ensure_eq!(pool.connection_count(), 1);
    ensure_eq!(pool.active_count(), 0);
    runtime::teardown_thread();
    Ok(())
}
