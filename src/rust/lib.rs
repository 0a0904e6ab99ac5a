// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative task-scheduling core.
//!
//! Each OS thread owns a single-threaded scheduler that runs tasks (futures placed in pooled fiber slots) until they
//! suspend. Tasks suspend on timers, broadcast events and the synchronization primitives built on top of them, and are
//! resumed only on their owning thread. I/O backends plug in through [runtime::driver::EventDriver].

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod collections;
pub mod runtime;

pub use self::{
    collections::connection_pool::{
        ConnectionPool,
        LockedConnection,
        PoolResource,
    },
    runtime::{
        config::Config,
        fail::Fail,
        scheduler::{
            TaskHandle,
            TaskId,
            TaskLocal,
            TaskState,
            Yielder,
            YielderHandle,
        },
        sync::{
            LocalManualEvent,
            LocalTaskSemaphore,
            LockGuard,
            Lockable,
            ManualEvent,
            RecursiveTaskMutex,
            TaskCondition,
            TaskMutex,
        },
        timer::Timer,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the enclosing [anyhow::Result] function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    )
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the enclosing [anyhow::Result] function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    )
                }
            },
        }
    }};
}
