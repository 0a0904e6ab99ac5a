// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context,
    fail::Fail,
};
use ::std::{
    any::Any,
    marker::PhantomData,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Source of dense key indexes. Zero means "not reserved yet".
static NEXT_KEY_INDEX: AtomicUsize = AtomicUsize::new(1);

/// Key to a value stored per task.
///
/// Keys are meant to be declared as statics. Each task sees its own value, starting out empty; values are dropped
/// when the task terminates.
///
/// ```
/// use ::fibercore::TaskLocal;
///
/// static REQUEST_ID: TaskLocal<u64> = TaskLocal::new();
/// ```
pub struct TaskLocal<T: 'static> {
    index: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: 'static> TaskLocal<T> {
    pub const fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Index of this key in the per-task storage, reserved on first use.
    fn index(&self) -> usize {
        let index: usize = self.index.load(Ordering::Acquire);
        if index != 0 {
            return index - 1;
        }
        let fresh: usize = NEXT_KEY_INDEX.fetch_add(1, Ordering::Relaxed);
        match self
            .index
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh - 1,
            Err(winner) => winner - 1,
        }
    }

    /// Runs `f` over the value of the running task. The value is moved out of the task for the duration of the call,
    /// so `f` sees `None` if it accesses the same key again.
    pub fn with<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> Result<R, Fail> {
        let Some(scheduler) = context::try_current_scheduler() else {
            return Err(Fail::new(libc::EPERM, "not running inside a task"));
        };
        let index: usize = self.index();
        let mut value: Option<T> = scheduler
            .take_local(index)?
            .and_then(|boxed: Box<dyn Any>| boxed.downcast::<T>().ok())
            .map(|boxed: Box<T>| *boxed);
        let result: R = f(&mut value);
        let displaced: Option<Box<dyn Any>> =
            scheduler.put_local(index, value.map(|value: T| Box::new(value) as Box<dyn Any>))?;
        drop(displaced);
        Ok(result)
    }

    /// Stores a value for the running task. Returns the previous one.
    pub fn set(&self, value: T) -> Result<Option<T>, Fail> {
        self.with(|slot: &mut Option<T>| slot.replace(value))
    }

    /// Removes the value of the running task.
    pub fn take(&self) -> Result<Option<T>, Fail> {
        self.with(|slot: &mut Option<T>| slot.take())
    }
}

impl<T: Clone + 'static> TaskLocal<T> {
    /// Returns a copy of the value of the running task.
    pub fn get(&self) -> Result<Option<T>, Fail> {
        self.with(|slot: &mut Option<T>| slot.clone())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: 'static> Default for TaskLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}
