// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod compression;
pub mod encryption;

#[cfg(test)]
mod compression_tests;


use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::Semaphore;

use crate::error::PoolError;
use hashing::Fingerprint;
use task_executor::Executor;

///
/// A lazy listing cursor: fingerprints arrive in backend-chosen order, produced in
/// batches by a worker thread so the consumer never blocks on directory or cursor scans.
///
pub type FingerprintStream = BoxStream<'static, Result<Fingerprint, PoolError>>;

///
/// The five operations every layer of the storage stack speaks: filters wrap a
/// subordinate Handler and transform keys and/or values in both directions; backends
/// terminate the chain.
///
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError>;

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError>;

    /// Stores idempotently: a fingerprint that already exists succeeds without rewriting.
    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError>;

    /// Deleting a missing fingerprint is not an error.
    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError>;

    async fn lister(&self) -> Result<FingerprintStream, PoolError>;
}

///
/// Runs CPU-bound filter work (compression, sealing) on the blocking pool, bounded to
/// hardware parallelism so filter jobs cannot starve backend I/O of blocking threads.
///
#[derive(Clone)]
pub(crate) struct CpuPool {
    executor: Executor,
    permits: Arc<Semaphore>,
}

impl CpuPool {
    pub(crate) fn new(executor: Executor) -> CpuPool {
        CpuPool {
            executor,
            permits: Arc::new(Semaphore::new(num_cpus::get())),
        }
    }

    pub(crate) async fn run<R, F>(&self, f: F) -> Result<R, PoolError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, PoolError> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PoolError::Filter(format!("CPU pool is shut down: {e}")))?;
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    f()
                },
                |e| Err(PoolError::Filter(format!("filter task failed: {e}"))),
            )
            .await
    }
}
