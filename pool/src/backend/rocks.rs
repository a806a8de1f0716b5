// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rocksdb::{IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::backend::{BatchApplier, WriteBatcher, WriteJob, WriteOp};
use crate::error::PoolError;
use crate::filter::{FingerprintStream, Handler};
use hashing::Fingerprint;
use task_executor::Executor;

const LIST_BATCH: usize = 1024;

///
/// Chunks in a RocksDB LSM store, created on demand. Reads need no transactions; writes
/// funnel through a `WriteBatcher` into synced `WriteBatch`es so that a burst of puts
/// costs one write-ahead-log sync instead of one per chunk.
///
pub struct RocksBackend {
    db: Arc<DB>,
    executor: Executor,
    io_permits: Arc<Semaphore>,
    batcher: Arc<WriteBatcher<RocksApplier>>,
}

impl RocksBackend {
    pub fn open(
        path: &Path,
        max_workers: usize,
        executor: Executor,
    ) -> Result<RocksBackend, PoolError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = Arc::new(DB::open(&options, path).map_err(|e| {
            PoolError::Backend(format!("failed to open RocksDB store at {path:?}: {e}"))
        })?);
        let batcher = WriteBatcher::new(RocksApplier { db: db.clone() }, executor.clone());
        Ok(RocksBackend {
            db,
            executor,
            io_permits: Arc::new(Semaphore::new(max_workers)),
            batcher,
        })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        self.io_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PoolError::Backend(format!("worker pool is shut down: {e}")))
    }
}

#[async_trait]
impl Handler for RocksBackend {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        let permit = self.acquire().await?;
        let db = self.db.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    db.get_pinned(fingerprint)
                        .map(|value| value.is_some())
                        .map_err(|e| {
                            PoolError::Backend(format!("error probing {fingerprint}: {e}"))
                        })
                },
                |e| Err(PoolError::Backend(format!("`has_chunk` task failed: {e}"))),
            )
            .await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let permit = self.acquire().await?;
        let db = self.db.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    match db.get(fingerprint) {
                        Ok(Some(value)) => Ok(Bytes::from(value)),
                        Ok(None) => Err(PoolError::NotFound(fingerprint)),
                        Err(e) => Err(PoolError::Backend(format!(
                            "error loading {fingerprint}: {e}"
                        ))),
                    }
                },
                |e| Err(PoolError::Backend(format!("`get_chunk` task failed: {e}"))),
            )
            .await
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        self.batcher.submit(WriteOp::Put(fingerprint, value)).await
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.batcher.submit(WriteOp::Del(fingerprint)).await
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        let (tx, mut rx) = mpsc::channel::<Result<Vec<Fingerprint>, PoolError>>(1);
        let db = self.db.clone();
        self.executor.native_spawn_blocking(move || {
            let mut batch = Vec::with_capacity(LIST_BATCH);
            for item in db.iterator(IteratorMode::Start) {
                match item {
                    Ok((key, _)) => {
                        if let Ok(fingerprint) = Fingerprint::from_bytes(&key) {
                            batch.push(fingerprint);
                        }
                        if batch.len() >= LIST_BATCH
                            && tx.blocking_send(Ok(std::mem::take(&mut batch))).is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(PoolError::Backend(format!(
                            "failed to advance iterator: {e}"
                        ))));
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.blocking_send(Ok(batch));
            }
        });
        let stream = async_stream::stream! {
            while let Some(batch) = rx.recv().await {
                match batch {
                    Ok(fingerprints) => {
                        for fingerprint in fingerprints {
                            yield Ok(fingerprint);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

struct RocksApplier {
    db: Arc<DB>,
}

impl BatchApplier for RocksApplier {
    fn apply_batch(&self, batch: Vec<WriteJob>) {
        let mut write_batch = WriteBatch::default();
        let mut completions = Vec::with_capacity(batch.len());
        for job in batch {
            match &job.op {
                WriteOp::Put(fingerprint, value) => write_batch.put(fingerprint, value),
                WriteOp::Del(fingerprint) => write_batch.delete(fingerprint),
            }
            completions.push(job.done);
        }
        let mut write_options = WriteOptions::default();
        write_options.set_sync(true);
        let result = self
            .db
            .write_opt(write_batch, &write_options)
            .map_err(|e| PoolError::Backend(format!("failed to commit write batch: {e}")));
        for done in completions {
            let _ = done.send(result.clone());
        }
    }
}
