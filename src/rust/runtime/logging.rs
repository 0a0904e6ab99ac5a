// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::parking_lot::{
    const_mutex,
    Mutex,
};
use ::std::sync::Once;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Log specification used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_SPEC: &str = "info";

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOGGER: Mutex<Option<LoggerHandle>> = const_mutex(None);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features.
pub fn initialize() {
    initialize_with(DEFAULT_LOG_SPEC)
}

/// Initializes logging with `spec` as the fallback specification. `RUST_LOG` takes precedence.
pub fn initialize_with(spec: &str) {
    INIT_LOG.call_once(|| match Logger::try_with_env_or_str(spec).and_then(|logger| logger.start()) {
        Ok(handle) => *LOGGER.lock() = Some(handle),
        Err(e) => eprintln!("logging::initialize(): failed to start logger ({:?})", e),
    });
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
