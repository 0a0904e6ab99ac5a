// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    ECANCELED,
    EIO,
    ESTALE,
    ETIMEDOUT,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure raised by the scheduler, its synchronization primitives, or a task body.
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fail {
    /// Creates a new failure.
    pub fn new(errno: c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// The cancellation condition delivered to an interrupted task at its next suspension point.
    pub fn interrupted() -> Self {
        Self::new(ECANCELED, "task interrupted")
    }

    /// Checks whether this failure is a cancellation condition.
    pub fn is_interrupted(&self) -> bool {
        self.errno == ECANCELED
    }

    /// Checks whether this failure is an expired timer race.
    pub fn is_timeout(&self) -> bool {
        self.errno == ETIMEDOUT
    }

    /// Checks whether this failure reports a pool handle used after its pool was invalidated.
    pub fn is_stale_handle(&self) -> bool {
        self.errno == ESTALE
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

/// Keeps the OS error code when there is one.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
