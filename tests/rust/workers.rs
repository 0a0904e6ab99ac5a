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
    runtime::{
        self,
        context,
    },
    Config,
    Fail,
};
use ::std::{
    collections::HashSet,
    sync::Once,
    thread,
    time::Duration,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

static SETUP: Once = Once::new();

/// Installs a runtime with two worker threads, once per process.
fn setup() -> Result<()> {
    let mut result: Result<(), Fail> = Ok(());
    SETUP.call_once(|| {
        result = Config::from_yaml_str("runtime:\n  worker_threads: 2\n  log_level: warn\n")
            .and_then(|config| runtime::initialize(&config));
    });
    Ok(result?)
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn tasks_spawned_on_workers_run_there() -> Result<()> {
    setup()?;
    let (tx, rx): (Sender<String>, Receiver<String>) = crossbeam_channel::unbounded();
    for _ in 0..8 {
        let tx: Sender<String> = tx.clone();
        runtime::spawn_on_worker(move || async move {
            runtime::yield_now().await?;
            let name: String = thread::current().name().unwrap_or_default().to_string();
            tx.send(name).map_err(|_| Fail::new(libc::EPIPE, "receiver is gone"))
        })?;
    }

    let mut threads: HashSet<String> = HashSet::new();
    for _ in 0..8 {
        threads.insert(rx.recv_timeout(Duration::from_secs(5))?);
    }
    ensure_eq!(threads.iter().all(|name| name.starts_with("fibercore-worker-")), true);
    ensure_eq!(threads.contains(&thread::current().name().unwrap_or_default().to_string()), false);
    Ok(())
}

#[test]
fn worker_tasks_can_sleep() -> Result<()> {
    setup()?;
    let (tx, rx): (Sender<Duration>, Receiver<Duration>) = crossbeam_channel::bounded(1);
    runtime::spawn_on_worker(move || async move {
        let start: std::time::Instant = std::time::Instant::now();
        runtime::sleep(Duration::from_millis(20)).await?;
        tx.send(start.elapsed()).map_err(|_| Fail::new(libc::EPIPE, "receiver is gone"))
    })?;
    ensure_eq!(rx.recv_timeout(Duration::from_secs(5))? >= Duration::from_millis(20), true);
    Ok(())
}

#[test]
fn oversized_worker_closure_is_rejected() -> Result<()> {
    setup()?;
    let payload: [u64; 64] = [1; 64];
    let result: Result<(), Fail> = runtime::spawn_on_worker(move || async move {
        let _total: u64 = payload.iter().sum();
        Ok(())
    });
    ensure_eq!(result.map_err(|e| e.errno), Err(libc::E2BIG));
    Ok(())
}

#[test]
fn runtime_reports_its_configuration() -> Result<()> {
    setup()?;
    let context = context::runtime().ok_or_else(|| anyhow::anyhow!("runtime is not initialized"))?;
    ensure_eq!(context.worker_threads(), 2);
    let config: Config = Config::default();
    ensure_eq!(runtime::initialize(&config).map_err(|e| e.errno), Err(libc::EEXIST));
    Ok(())
}
