// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::used_underscore_binding
)]
#![allow(clippy::new_without_default)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

///
/// A handle to the runtime that executes backend I/O and CPU-bound filter work.
///
/// Executors come in two flavors:
/// * "borrowed": created with `Self::new()` from an ambient tokio Runtime (typically the
///   one a `#[tokio::main]` or `#[tokio::test]` macro set up). Dropping every clone does
///   not shut the Runtime down, and the shutdown methods are no-ops.
/// * "owned": created with `Self::new_owned()`. The Runtime is shut down when `shutdown`
///   is called, or leaked tasks are reported if they outlive the timeout.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for the Runtime of the current thread context. Panics outside
    /// of a Runtime: long-lived processes should prefer `Self::new_owned`.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor with its own Runtime. `max_blocking_threads` bounds the
    /// threads available to `spawn_blocking` jobs, and so bounds how many backend I/O or
    /// filter operations run concurrently.
    ///
    pub fn new_owned(
        worker_threads: usize,
        max_blocking_threads: usize,
    ) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .max_blocking_threads(max_blocking_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// A clone of this Executor that is disconnected from shutdown: see the struct docs.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    ///
    /// Run a Future as a new task. If the task exits abnormally, the given closure is
    /// called to recover: usually it converts the JoinError into the task's error type.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Run a Future as a new task, and return its JoinHandle. Dropping the handle does
    /// not cancel the task.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Run a blocking closure on the threads reserved for long-running I/O.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    ///
    /// Run a Future to completion from synchronous code. Must not be called from within
    /// the runtime itself.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Shut down an owned Executor's Runtime, waiting up to the timeout for running
    /// tasks. No effect on borrowed Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// True once `shutdown` has run for an owned Executor. Always true for borrowed ones.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}
