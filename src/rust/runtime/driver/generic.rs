// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Portable driver: a timer heap plus a condition variable that cross-thread signals kick.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::driver::{
    DriverSignal,
    EventDriver,
    ExitReason,
    TimerCallback,
    TimerId,
};
use ::core::cmp::Reverse;
use ::parking_lot::{
    Condvar,
    Mutex,
};
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    collections::BinaryHeap,
    mem,
    rc::Rc,
    sync::Arc,
    task::Waker,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct TimerQueueEntry {
    expiry: Instant,
    id: TimerId,
    /// Arm sequence of the timer when this entry was queued. Entries of earlier arms are skipped.
    arm_seq: u64,
}

struct TimerEntry {
    deadline: Option<Instant>,
    period: Option<Duration>,
    callback: Option<Rc<RefCell<TimerCallback>>>,
    waiters: Vec<Waker>,
    fire_count: u64,
    arm_seq: u64,
}

#[derive(Default)]
struct TimerTable {
    timers: Slab<TimerEntry>,
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
    armed: usize,
}

#[derive(Default)]
struct WakeupState {
    notified: bool,
    exit: bool,
}

#[derive(Default)]
struct DriverWakeup {
    state: Mutex<WakeupState>,
    condvar: Condvar,
}

/// Signal handed out by [GenericDriver::create_manual_event].
struct GenericSignal {
    wakeup: Arc<DriverWakeup>,
}

/// Driver without I/O sources.
#[derive(Default)]
pub struct GenericDriver {
    timers: RefCell<TimerTable>,
    wakeup: Arc<DriverWakeup>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerTable {
    fn disarm(&mut self, entry_index: usize) -> Vec<Waker> {
        match self.timers.get_mut(entry_index) {
            Some(entry) => {
                if entry.deadline.take().is_some() {
                    self.armed -= 1;
                }
                entry.arm_seq += 1;
                mem::take(&mut entry.waiters)
            },
            None => Vec::new(),
        }
    }

    fn next_expiry(&mut self) -> Option<Instant> {
        // Drop stale heads so that they do not cause spurious wakeups.
        while let Some(Reverse(head)) = self.heap.peek() {
            match self.timers.get(head.id.0) {
                Some(entry) if entry.arm_seq == head.arm_seq && entry.deadline.is_some() => return Some(head.expiry),
                _ => {
                    self.heap.pop();
                },
            }
        }
        None
    }
}

impl GenericDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires every timer whose deadline has passed. Returns how many fired.
    fn fire_due_timers(&self) -> usize {
        let now: Instant = Instant::now();
        let mut fired: usize = 0;
        loop {
            let (id, callback, waiters): (TimerId, Option<Rc<RefCell<TimerCallback>>>, Vec<Waker>) = {
                let mut table = self.timers.borrow_mut();
                let table: &mut TimerTable = &mut table;
                match table.heap.peek() {
                    Some(Reverse(head)) if head.expiry <= now => (),
                    _ => break,
                }
                let head: TimerQueueEntry = match table.heap.pop() {
                    Some(Reverse(head)) => head,
                    None => break,
                };
                let entry: &mut TimerEntry = match table.timers.get_mut(head.id.0) {
                    Some(entry) if entry.arm_seq == head.arm_seq && entry.deadline == Some(head.expiry) => entry,
                    _ => continue,
                };
                entry.fire_count += 1;
                match entry.period {
                    Some(period) => {
                        let mut next: Instant = head.expiry + period;
                        if next <= now {
                            next = now + period;
                        }
                        entry.deadline = Some(next);
                        let arm_seq: u64 = entry.arm_seq;
                        table.heap.push(Reverse(TimerQueueEntry {
                            expiry: next,
                            id: head.id,
                            arm_seq,
                        }));
                    },
                    None => {
                        entry.deadline = None;
                        table.armed -= 1;
                    },
                }
                let waiters: Vec<Waker> = mem::take(&mut entry.waiters);
                (head.id, entry.callback.clone(), waiters)
            };
            fired += 1;
            trace!("fire_due_timers(): id={:?}", id);
            for waker in waiters {
                waker.wake();
            }
            // The table is not borrowed here, so the callback may re-arm or release timers.
            if let Some(callback) = callback {
                if let Ok(mut callback) = callback.try_borrow_mut() {
                    (*callback)(id);
                }
            }
        }
        fired
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl EventDriver for GenericDriver {
    fn create_timer(&self, callback: Option<TimerCallback>) -> TimerId {
        let entry: TimerEntry = TimerEntry {
            deadline: None,
            period: None,
            callback: callback.map(|cb| Rc::new(RefCell::new(cb))),
            waiters: Vec::new(),
            fire_count: 0,
            arm_seq: 0,
        };
        TimerId(self.timers.borrow_mut().timers.insert(entry))
    }

    fn rearm_timer(&self, id: TimerId, timeout: Duration, periodic: bool) {
        let mut table = self.timers.borrow_mut();
        let table: &mut TimerTable = &mut table;
        let Some(entry) = table.timers.get_mut(id.0) else {
            warn!("rearm_timer(): unknown timer (id={:?})", id);
            return;
        };
        let expiry: Instant = Instant::now() + timeout;
        if entry.deadline.is_none() {
            table.armed += 1;
        }
        entry.arm_seq += 1;
        entry.deadline = Some(expiry);
        entry.period = if periodic && !timeout.is_zero() {
            Some(timeout)
        } else {
            None
        };
        let arm_seq: u64 = entry.arm_seq;
        table.heap.push(Reverse(TimerQueueEntry { expiry, id, arm_seq }));
    }

    fn stop_timer(&self, id: TimerId) {
        let waiters: Vec<Waker> = self.timers.borrow_mut().disarm(id.0);
        for waker in waiters {
            waker.wake();
        }
    }

    fn wait_timer(&self, id: TimerId, waker: &Waker) -> bool {
        let mut table = self.timers.borrow_mut();
        match table.timers.get_mut(id.0) {
            Some(entry) if entry.deadline.is_some() => {
                if !entry.waiters.iter().any(|w| w.will_wake(waker)) {
                    entry.waiters.push(waker.clone());
                }
                true
            },
            _ => false,
        }
    }

    fn is_timer_pending(&self, id: TimerId) -> bool {
        self.timers
            .borrow()
            .timers
            .get(id.0)
            .is_some_and(|entry| entry.deadline.is_some())
    }

    fn timer_fire_count(&self, id: TimerId) -> u64 {
        self.timers.borrow().timers.get(id.0).map_or(0, |entry| entry.fire_count)
    }

    fn release_timer(&self, id: TimerId) {
        let (waiters, entry): (Vec<Waker>, Option<TimerEntry>) = {
            let mut table = self.timers.borrow_mut();
            let waiters: Vec<Waker> = table.disarm(id.0);
            (waiters, table.timers.try_remove(id.0))
        };
        // Dropping the callback may run arbitrary code, so do it outside of the borrow.
        drop(entry);
        for waker in waiters {
            waker.wake();
        }
    }

    fn pending_timer_count(&self) -> usize {
        self.timers.borrow().armed
    }

    fn create_manual_event(&self) -> Arc<dyn DriverSignal> {
        Arc::new(GenericSignal {
            wakeup: self.wakeup.clone(),
        })
    }

    fn process_events(&self, timeout: Option<Duration>) -> ExitReason {
        let limit: Option<Instant> = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let fired: usize = self.fire_due_timers();
            let next_expiry: Option<Instant> = self.timers.borrow_mut().next_expiry();
            let mut state = self.wakeup.state.lock();
            if state.exit {
                state.exit = false;
                return ExitReason::Exited;
            }
            if state.notified || fired > 0 {
                state.notified = false;
                return ExitReason::Idle;
            }
            let now: Instant = Instant::now();
            if let Some(limit) = limit {
                if now >= limit {
                    return ExitReason::Timeout;
                }
            }
            let wake_at: Option<Instant> = match (limit, next_expiry) {
                (Some(limit), Some(expiry)) => Some(limit.min(expiry)),
                (limit, expiry) => limit.or(expiry),
            };
            match wake_at {
                Some(at) if at > now => {
                    self.wakeup.condvar.wait_until(&mut state, at);
                },
                Some(_) => (),
                None => self.wakeup.condvar.wait(&mut state),
            }
        }
    }

    fn exit_event_loop(&self) {
        let mut state = self.wakeup.state.lock();
        state.exit = true;
        self.wakeup.condvar.notify_all();
    }
}

impl DriverSignal for GenericSignal {
    fn trigger(&self) {
        let mut state = self.wakeup.state.lock();
        state.notified = true;
        self.wakeup.condvar.notify_all();
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        self.expiry == other.expiry && self.id == other.id
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.id.0.cmp(&other.id.0))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
