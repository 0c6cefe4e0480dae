//! Owns the tokio runtime that every connection and Host I/O task runs on
//! (spec §4.9).
//!
//! Mirrors a classic reactor-plus-worker-pool split: a dedicated runtime is
//! built up front with a fixed worker count, started explicitly, and can be
//! asked to shut down and join its worker threads before the process exits.

use std::sync::OnceLock;

use tokio::runtime::Runtime;
use tracing::{info, warn};

/// A named multi-threaded tokio runtime with explicit start/stop control.
///
/// Unlike a bare `#[tokio::main]` runtime, this type is meant to be built
/// once, handed to a server for its lifetime, and shut down on a clean exit
/// path so that `tokio::spawn`ed connection tasks are given a chance to
/// finish before the process exits.
pub struct Executor {
    runtime: Runtime,
    worker_threads: usize,
}

impl Executor {
    /// Builds a multi-threaded runtime with `worker_threads` worker threads.
    ///
    /// `worker_threads` must be at least 1.
    pub fn new(worker_threads: usize) -> std::io::Result<Self> {
        assert!(worker_threads >= 1, "executor needs at least one thread");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .thread_name("gdbstub-worker")
            .build()?;
        Ok(Self {
            runtime,
            worker_threads,
        })
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Runs `future` to completion on this executor's runtime, blocking the
    /// calling thread. Intended to be called once, from `main`, with the
    /// server's top-level accept loop.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        info!(threads = self.worker_threads, "starting executor");
        self.runtime.block_on(future)
    }

    /// Spawns `future` onto this executor without blocking the caller.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Shuts the runtime down, waiting up to `timeout` for in-flight tasks
    /// to finish before the remaining ones are dropped.
    pub fn stop(self, timeout: std::time::Duration) {
        warn!("stopping executor, waiting for in-flight connections to finish");
        self.runtime.shutdown_timeout(timeout);
    }
}

static INSTANCE: OnceLock<Executor> = OnceLock::new();

/// Returns the process-wide executor, building one with `default_threads`
/// workers the first time it's called. Later calls ignore `default_threads`
/// and return the already-built instance, matching a lazily-initialized
/// singleton.
pub fn instance(default_threads: usize) -> &'static Executor {
    INSTANCE.get_or_init(|| Executor::new(default_threads).expect("failed to build runtime"))
}
