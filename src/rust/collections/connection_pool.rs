// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Task-aware pool of reusable connections.
//!
//! At most `max_concurrency` connections are checked out at a time. A checked out connection is bound to the task that
//! acquired it; copies of its [LockedConnection] made by that task share the same checkout, and the last one to go
//! returns the connection to the pool.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::current_owner,
    fail::Fail,
    scheduler::TaskOwner,
    sync::LocalTaskSemaphore,
};
use ::async_trait::async_trait;
use ::std::{
    cell::{
        Ref,
        RefCell,
        RefMut,
    },
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Capabilities of a pooled connection.
#[async_trait(?Send)]
pub trait PoolResource {
    /// Whether an idle connection found disconnected is reconnected in place instead of being replaced.
    const RECONNECT: bool = false;

    fn is_connected(&self) -> bool {
        true
    }

    async fn reconnect(&mut self) -> Result<(), Fail> {
        Err(Fail::new(libc::ENOTSUP, "connection does not support reconnecting"))
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

type ConnectionFuture<C> = Pin<Box<dyn Future<Output = Result<C, Fail>>>>;
type ConnectionFactory<C> = Box<dyn Fn() -> ConnectionFuture<C>>;

struct PoolEntry<C> {
    id: u64,
    connection: Rc<RefCell<C>>,
}

struct PoolState<C> {
    /// Bumped by [ConnectionPool::clear]. Handles from older generations are stale.
    generation: u64,
    next_id: u64,
    connections: Vec<PoolEntry<C>>,
    /// Live handles per checked out connection. Idle connections have no entry.
    lock_counts: HashMap<u64, usize>,
}

struct PoolInner<C> {
    factory: ConnectionFactory<C>,
    semaphore: LocalTaskSemaphore,
    state: RefCell<PoolState<C>>,
}

/// Pool of connections created on demand by a factory.
pub struct ConnectionPool<C: PoolResource> {
    inner: Rc<PoolInner<C>>,
}

/// Checked out connection.
pub struct LockedConnection<C: PoolResource> {
    pool: Rc<PoolInner<C>>,
    id: u64,
    generation: u64,
    connection: Rc<RefCell<C>>,
    owner: Option<TaskOwner>,
}

/// Idle connection taken out of the pool.
enum IdleConnection<C> {
    Ready(u64, Rc<RefCell<C>>),
    Disconnected(u64, C),
}

/// Admission slot that goes back to the semaphore unless handed over to a [LockedConnection].
struct AdmissionSlot<'a> {
    semaphore: &'a LocalTaskSemaphore,
    armed: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<C: PoolResource + 'static> ConnectionPool<C> {
    pub fn new<F, Fut>(factory: F, max_concurrency: usize) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<C, Fail>> + 'static,
    {
        let factory: ConnectionFactory<C> = Box::new(move || -> ConnectionFuture<C> { Box::pin(factory()) });
        Self {
            inner: Rc::new(PoolInner {
                factory,
                semaphore: LocalTaskSemaphore::new(max_concurrency),
                state: RefCell::new(PoolState {
                    generation: 0,
                    next_id: 0,
                    connections: Vec::new(),
                    lock_counts: HashMap::new(),
                }),
            }),
        }
    }

    /// Checks out a connection, waiting while `max_concurrency` connections are out. An interrupt delivered during
    /// that wait fails it without checking anything out.
    pub async fn acquire(&self) -> Result<LockedConnection<C>, Fail> {
        self.inner.semaphore.lock(0).await?;
        let mut slot: AdmissionSlot = AdmissionSlot {
            semaphore: &self.inner.semaphore,
            armed: true,
        };

        let (id, connection): (u64, Rc<RefCell<C>>) = match self.take_idle() {
            Some(IdleConnection::Ready(id, connection)) => (id, connection),
            Some(IdleConnection::Disconnected(id, connection)) => match self.revive(id, connection).await {
                Some(connection) => (id, connection),
                None => self.create().await?,
            },
            None => self.create().await?,
        };

        slot.armed = false;
        let generation: u64 = self.inner.state.borrow().generation;
        trace!("acquire(): connection {} checked out", id);
        Ok(LockedConnection {
            pool: self.inner.clone(),
            id,
            generation,
            connection,
            owner: current_owner(),
        })
    }

    /// Finds the first idle connection. Disconnected ones leave the pool so they can be fixed or dropped.
    fn take_idle(&self) -> Option<IdleConnection<C>> {
        let mut guard = self.inner.state.borrow_mut();
        let state: &mut PoolState<C> = &mut guard;
        loop {
            let lock_counts: &HashMap<u64, usize> = &state.lock_counts;
            let position: usize = state
                .connections
                .iter()
                .position(|entry: &PoolEntry<C>| !lock_counts.contains_key(&entry.id))?;
            let connected: bool = state.connections[position]
                .connection
                .try_borrow()
                .is_ok_and(|connection| connection.is_connected());
            if connected {
                let entry: &PoolEntry<C> = &state.connections[position];
                state.lock_counts.insert(entry.id, 1);
                return Some(IdleConnection::Ready(entry.id, entry.connection.clone()));
            }

            let entry: PoolEntry<C> = state.connections.remove(position);
            match Rc::try_unwrap(entry.connection) {
                Ok(connection) => return Some(IdleConnection::Disconnected(entry.id, connection.into_inner())),
                Err(_) => warn!("take_idle(): dropping connection {} that is still referenced", entry.id),
            }
        }
    }

    async fn revive(&self, id: u64, mut connection: C) -> Option<Rc<RefCell<C>>> {
        if !C::RECONNECT {
            debug!("revive(): replacing disconnected connection {}", id);
            return None;
        }
        match connection.reconnect().await {
            Ok(()) => Some(self.insert(id, connection)),
            Err(e) => {
                warn!("revive(): failed to reconnect connection {} ({:?})", id, e);
                None
            },
        }
    }

    async fn create(&self) -> Result<(u64, Rc<RefCell<C>>), Fail> {
        let connection: C = (self.inner.factory)().await?;
        let id: u64 = {
            let mut state = self.inner.state.borrow_mut();
            let id: u64 = state.next_id;
            state.next_id += 1;
            id
        };
        trace!("create(): new connection {}", id);
        Ok((id, self.insert(id, connection)))
    }

    /// Adds a checked out connection to the pool.
    fn insert(&self, id: u64, connection: C) -> Rc<RefCell<C>> {
        let connection: Rc<RefCell<C>> = Rc::new(RefCell::new(connection));
        let mut state = self.inner.state.borrow_mut();
        state.connections.push(PoolEntry {
            id,
            connection: connection.clone(),
        });
        state.lock_counts.insert(id, 1);
        connection
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.semaphore.max_locks()
    }

    /// Changes how many connections may be checked out at once. Lowering it does not revoke checkouts.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.inner.semaphore.set_max_locks(max_concurrency);
    }

    /// Drops the idle connections matching `predicate`. Returns how many were dropped.
    pub fn remove_unused<P: FnMut(&C) -> bool>(&self, mut predicate: P) -> usize {
        let removed: Vec<PoolEntry<C>> = {
            let mut guard = self.inner.state.borrow_mut();
            let state: &mut PoolState<C> = &mut guard;
            let lock_counts: &HashMap<u64, usize> = &state.lock_counts;
            let mut removed: Vec<PoolEntry<C>> = Vec::new();
            let mut kept: Vec<PoolEntry<C>> = Vec::with_capacity(state.connections.len());
            for entry in state.connections.drain(..) {
                let idle: bool = !lock_counts.contains_key(&entry.id);
                if idle && entry.connection.try_borrow().is_ok_and(|connection| predicate(&connection)) {
                    removed.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            state.connections = kept;
            removed
        };
        removed.len()
    }

    /// Forgets every connection. Handles still out keep their admission slot but report stale access.
    pub fn clear(&self) {
        let dropped: Vec<PoolEntry<C>> = {
            let mut state = self.inner.state.borrow_mut();
            state.generation += 1;
            state.connections.drain(..).collect()
        };
        debug!("clear(): dropped {} connections", dropped.len());
    }

    /// Number of connections in the pool, idle or not.
    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().connections.len()
    }

    /// Number of connections checked out.
    pub fn active_count(&self) -> usize {
        self.inner.state.borrow().lock_counts.len()
    }
}

impl<C: PoolResource> LockedConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fails with `ESTALE` if the pool was cleared since this connection was checked out.
    pub fn validate(&self) -> Result<(), Fail> {
        let state = self.pool.state.borrow();
        if state.generation != self.generation || !state.lock_counts.contains_key(&self.id) {
            let cause: String = format!("connection {} no longer belongs to its pool", self.id);
            error!("validate(): {}", cause);
            return Err(Fail::new(libc::ESTALE, &cause));
        }
        Ok(())
    }

    pub fn get(&self) -> Result<Ref<'_, C>, Fail> {
        self.validate()?;
        self.connection.try_borrow().map_err(|_| {
            let cause: String = format!("connection {} is mutably borrowed", self.id);
            error!("get(): {}", cause);
            Fail::new(libc::EBUSY, &cause)
        })
    }

    pub fn get_mut(&self) -> Result<RefMut<'_, C>, Fail> {
        self.validate()?;
        self.connection.try_borrow_mut().map_err(|_| {
            let cause: String = format!("connection {} is already borrowed", self.id);
            error!("get_mut(): {}", cause);
            Fail::new(libc::EBUSY, &cause)
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<C: PoolResource> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolResource> Clone for LockedConnection<C> {
    /// Shares the checkout. Only the task that acquired the connection may do this.
    fn clone(&self) -> Self {
        let caller: Option<TaskOwner> = current_owner();
        if caller != self.owner {
            panic!(
                "connection {} checked out by {:?} was copied by {:?}",
                self.id, self.owner, caller
            );
        }
        if let Some(count) = self.pool.state.borrow_mut().lock_counts.get_mut(&self.id) {
            *count += 1;
        }
        Self {
            pool: self.pool.clone(),
            id: self.id,
            generation: self.generation,
            connection: self.connection.clone(),
            owner: self.owner,
        }
    }
}

impl<C: PoolResource> Drop for LockedConnection<C> {
    fn drop(&mut self) {
        let last: bool = {
            let mut state = self.pool.state.borrow_mut();
            match state.lock_counts.get_mut(&self.id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                },
                Some(_) => {
                    state.lock_counts.remove(&self.id);
                    true
                },
                None => {
                    warn!("drop(): connection {} was already released", self.id);
                    false
                },
            }
        };
        if last {
            trace!("drop(): connection {} returned", self.id);
            if let Err(e) = self.pool.semaphore.unlock() {
                warn!("drop(): failed to release admission slot ({:?})", e);
            }
        }
    }
}

impl<C: PoolResource> fmt::Debug for LockedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedConnection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.semaphore.unlock() {
                warn!("drop(): failed to release admission slot ({:?})", e);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
