// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum size, in bytes, of the closure handed to spawn. Larger closures must box their captures.
pub const TASK_CLOSURE_SIZE_MAX: usize = 256;

/// Sequence value at which the waiter sequence numbers of a semaphore are rebased towards zero.
pub const SEMAPHORE_SEQUENCE_REBASE: u32 = u32::MAX - 1;

/// Default number of fiber slots preallocated per thread.
pub const FIBER_POOL_SIZE_DEFAULT: usize = 64;
