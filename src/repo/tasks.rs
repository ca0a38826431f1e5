//! Background Tasks
//!
//! One long-lived Writer, Merger, and LayerCleaner thread per repo. Each
//! loop waits on its wake channel with the configured period as timeout, so
//! a signal runs the pass immediately and silence runs it periodically.
//!
//! I/O failures in these passes are fatal: they sit on invariant-critical
//! durability paths where partial failure cannot be safely continued, so the
//! process logs at error severity and aborts (crash-and-restart recovery
//! rebuilds state from the catalog).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::error;

use crate::error::Result;

use super::RepoInner;

/// Spawn the three background tasks for a repo
pub(crate) fn spawn_all(inner: &Arc<RepoInner>) -> Result<Vec<JoinHandle<()>>> {
    let writer = {
        let inner = Arc::clone(inner);
        thread::Builder::new()
            .name("strata-writer".to_string())
            .spawn(move || writer_loop(&inner))?
    };
    let merger = {
        let inner = Arc::clone(inner);
        thread::Builder::new()
            .name("strata-merger".to_string())
            .spawn(move || merger_loop(&inner))?
    };
    let cleaner = {
        let inner = Arc::clone(inner);
        thread::Builder::new()
            .name("strata-cleaner".to_string())
            .spawn(move || cleaner_loop(&inner))?
    };
    Ok(vec![writer, merger, cleaner])
}

/// Wait one period on `signal`, returning false once the channel is gone
fn wait(signal: &Receiver<()>, period: Duration) -> bool {
    !matches!(signal.recv_timeout(period), Err(RecvTimeoutError::Disconnected))
}

fn writer_loop(inner: &Arc<RepoInner>) {
    loop {
        if !wait(&inner.write_signal.1, inner.config.write_delay)
            || inner.shutdown.load(Ordering::SeqCst)
        {
            return;
        }
        if let Err(e) = inner.writer_pass() {
            error!(error = %e, "writer pass failed; aborting");
            std::process::abort();
        }
    }
}

fn merger_loop(inner: &Arc<RepoInner>) {
    loop {
        if !wait(&inner.merge_signal.1, inner.config.merge_delay)
            || inner.shutdown.load(Ordering::SeqCst)
        {
            return;
        }
        if let Err(e) = inner.merger_pass() {
            error!(error = %e, "merger pass failed; aborting");
            std::process::abort();
        }
    }
}

fn cleaner_loop(inner: &Arc<RepoInner>) {
    loop {
        if !wait(&inner.clean_signal.1, inner.config.layer_cleaning_interval)
            || inner.shutdown.load(Ordering::SeqCst)
        {
            return;
        }
        if let Err(e) = inner.cleaner_pass() {
            error!(error = %e, "layer cleaner pass failed; aborting");
            std::process::abort();
        }
    }
}
