// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    check_interrupt,
    context,
    driver::{
        EventDriver,
        TimerId,
    },
    fail::Fail,
};
use ::async_trait::async_trait;
use ::futures::{
    future::{
        self,
        FusedFuture,
    },
    FutureExt,
};
use ::std::{
    future::Future,
    rc::Rc,
    task::Poll,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Timer of the calling thread's driver. Released when dropped.
pub struct Timer {
    id: TimerId,
    driver: Rc<dyn EventDriver>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Timer {
    /// Creates a disarmed timer.
    pub fn new() -> Result<Self, Fail> {
        let driver: Rc<dyn EventDriver> = context::current_scheduler()?.driver();
        let id: TimerId = driver.create_timer(None);
        Ok(Self { id, driver })
    }

    /// Creates a disarmed timer that runs `callback` on this thread every time it fires.
    pub fn with_callback<F: FnMut(TimerId) + 'static>(callback: F) -> Result<Self, Fail> {
        let driver: Rc<dyn EventDriver> = context::current_scheduler()?.driver();
        let id: TimerId = driver.create_timer(Some(Box::new(callback)));
        Ok(Self { id, driver })
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Arms the timer to fire after `timeout`, and then every `timeout` if `periodic` is set. Any previous deadline is
    /// discarded.
    pub fn rearm(&self, timeout: Duration, periodic: bool) {
        self.driver.rearm_timer(self.id, timeout, periodic);
    }

    /// Disarms the timer. Tasks waiting on it resume.
    pub fn stop(&self) {
        self.driver.stop_timer(self.id);
    }

    pub fn is_pending(&self) -> bool {
        self.driver.is_timer_pending(self.id)
    }

    /// Number of times the timer has fired.
    pub fn fire_count(&self) -> u64 {
        self.driver.timer_fire_count(self.id)
    }

    /// Waits until the timer fires or is stopped. Returns immediately if it is not armed.
    pub async fn wait(&self) -> Result<(), Fail> {
        self.wait_inner(true).await
    }

    /// Same as [Timer::wait], ignoring interrupts.
    pub async fn wait_uninterruptible(&self) {
        // Nothing can fail without interrupts.
        if self.wait_inner(false).await.is_err() {
            warn!("wait_uninterruptible(): unexpected failure");
        }
    }

    async fn wait_inner(&self, interruptible: bool) -> Result<(), Fail> {
        if !self.is_pending() {
            return Ok(());
        }
        let start: u64 = self.fire_count();
        let mut suspended: bool = false;
        future::poll_fn(|context| {
            if suspended && interruptible {
                check_interrupt()?;
            }
            if self.fire_count() != start || !self.is_pending() {
                return Poll::Ready(Ok(()));
            }
            if !suspended && interruptible {
                check_interrupt()?;
            }
            if !self.driver.wait_timer(self.id, context.waker()) {
                return Poll::Ready(Ok(()));
            }
            suspended = true;
            Poll::Pending
        })
        .await
    }
}

/// Suspends the running task for `duration`. A zero duration returns right away.
pub async fn sleep(duration: Duration) -> Result<(), Fail> {
    if duration.is_zero() {
        return Ok(());
    }
    let timer: Timer = Timer::new()?;
    timer.rearm(duration, false);
    timer.wait().await
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Provides useful high-level future-related methods.
#[async_trait(?Send)]
pub trait UtilityMethods: Future + FusedFuture + Unpin {
    /// Transforms our current future to include a timeout. We either return the results of the
    /// future finishing or a Timeout error. Whichever happens first.
    async fn with_timeout<Timer>(&mut self, timer: Timer) -> Result<Self::Output, Fail>
    where
        Timer: Future<Output = Result<(), Fail>>,
    {
        futures::select! {
            result = self => Ok(result),
            result = timer.fuse() => match result {
                Ok(()) => Err(Fail::new(libc::ETIMEDOUT, "timer expired")),
                Err(e) => Err(e),
            },
        }
    }
}

// Implement UtilityMethods for any Future that implements Unpin and FusedFuture.
impl<F: ?Sized> UtilityMethods for F where F: Future + Unpin + FusedFuture {}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Timer {
    fn drop(&mut self) {
        self.driver.release_timer(self.id);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
