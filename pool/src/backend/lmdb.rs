// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::backend::{BatchApplier, WriteBatcher, WriteJob, WriteOp};
use crate::error::PoolError;
use crate::filter::{FingerprintStream, Handler};
use hashing::Fingerprint;
use task_executor::Executor;

const LIST_BATCH: usize = 1024;

///
/// Chunks in a single LMDB environment. Each read runs in its own read transaction on
/// the blocking pool; writes are coalesced by a `WriteBatcher` because an LMDB
/// environment permits only one write transaction at a time.
///
pub struct LmdbBackend {
    env: Arc<Environment>,
    db: Database,
    executor: Executor,
    io_permits: Arc<Semaphore>,
    batcher: Arc<WriteBatcher<LmdbApplier>>,
}

impl LmdbBackend {
    pub fn open(
        path: &Path,
        max_workers: usize,
        executor: Executor,
    ) -> Result<LmdbBackend, PoolError> {
        std::fs::create_dir_all(path)
            .map_err(|e| PoolError::Backend(format!("failed to create {path:?}: {e}")))?;
        let env = Arc::new(open_env(path)?);
        let db = env
            .create_db(None, DatabaseFlags::empty())
            .map_err(|e| PoolError::Backend(format!("failed to open database at {path:?}: {e}")))?;
        let batcher = WriteBatcher::new(
            LmdbApplier {
                env: env.clone(),
                db,
            },
            executor.clone(),
        );
        Ok(LmdbBackend {
            env,
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

///
/// Opens the environment with the largest map size the platform will grant, probing
/// downwards by powers of two. NO_TLS unties read transactions from OS threads, which
/// matters because reads run on a recycled blocking pool.
///
fn open_env(path: &Path) -> Result<Environment, PoolError> {
    let mut last_error = None;
    for exponent in (27..=47).rev() {
        match Environment::new()
            .set_flags(EnvironmentFlags::NO_TLS)
            .set_map_size(1_usize << exponent)
            .open(path)
        {
            Ok(env) => {
                log::debug!("opened LMDB pool at {path:?} with a 2^{exponent} byte map");
                return Ok(env);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(PoolError::Backend(format!(
        "failed to open LMDB environment at {path:?}: {last_error:?}"
    )))
}

#[async_trait]
impl Handler for LmdbBackend {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        let permit = self.acquire().await?;
        let env = self.env.clone();
        let db = self.db;
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    let txn = env
                        .begin_ro_txn()
                        .map_err(|e| PoolError::Backend(format!("failed to begin read transaction: {e}")))?;
                    match txn.get(db, &fingerprint) {
                        Ok(_) => Ok(true),
                        Err(lmdb::Error::NotFound) => Ok(false),
                        Err(e) => Err(PoolError::Backend(format!(
                            "error probing {fingerprint}: {e}"
                        ))),
                    }
                },
                |e| Err(PoolError::Backend(format!("`has_chunk` task failed: {e}"))),
            )
            .await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let permit = self.acquire().await?;
        let env = self.env.clone();
        let db = self.db;
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    let txn = env
                        .begin_ro_txn()
                        .map_err(|e| PoolError::Backend(format!("failed to begin read transaction: {e}")))?;
                    match txn.get(db, &fingerprint) {
                        Ok(bytes) => Ok(Bytes::copy_from_slice(bytes)),
                        Err(lmdb::Error::NotFound) => Err(PoolError::NotFound(fingerprint)),
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
        let env = self.env.clone();
        let db = self.db;
        self.executor.native_spawn_blocking(move || {
            let scan = || -> Result<(), PoolError> {
                let txn = env
                    .begin_ro_txn()
                    .map_err(|e| PoolError::Backend(format!("failed to begin read transaction: {e}")))?;
                let mut cursor = txn
                    .open_ro_cursor(db)
                    .map_err(|e| PoolError::Backend(format!("failed to open read cursor: {e}")))?;
                let mut batch = Vec::with_capacity(LIST_BATCH);
                for key_res in cursor.iter() {
                    let (key, _) = key_res
                        .map_err(|e| PoolError::Backend(format!("failed to advance cursor: {e}")))?;
                    if let Ok(fingerprint) = Fingerprint::from_bytes(key) {
                        batch.push(fingerprint);
                    }
                    if batch.len() >= LIST_BATCH
                        && tx.blocking_send(Ok(std::mem::take(&mut batch))).is_err()
                    {
                        return Ok(());
                    }
                }
                if !batch.is_empty() {
                    let _ = tx.blocking_send(Ok(batch));
                }
                Ok(())
            };
            if let Err(e) = scan() {
                let _ = tx.blocking_send(Err(e));
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

struct LmdbApplier {
    env: Arc<Environment>,
    db: Database,
}

impl BatchApplier for LmdbApplier {
    fn apply_batch(&self, batch: Vec<WriteJob>) {
        let mut txn = match self.env.begin_rw_txn() {
            Ok(txn) => txn,
            Err(e) => {
                let err = PoolError::Backend(format!("failed to begin write transaction: {e}"));
                for job in batch {
                    let _ = job.done.send(Err(err.clone()));
                }
                return;
            }
        };
        let mut completed = Vec::with_capacity(batch.len());
        for job in batch {
            let result = match &job.op {
                WriteOp::Put(fingerprint, value) => {
                    match txn.put(self.db, fingerprint, value, WriteFlags::NO_OVERWRITE) {
                        // Re-puts of an existing chunk are no-ops.
                        Ok(()) | Err(lmdb::Error::KeyExist) => Ok(()),
                        Err(e) => Err(PoolError::Backend(format!(
                            "error storing {fingerprint}: {e}"
                        ))),
                    }
                }
                WriteOp::Del(fingerprint) => match txn.del(self.db, fingerprint, None) {
                    Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
                    Err(e) => Err(PoolError::Backend(format!(
                        "error removing {fingerprint}: {e}"
                    ))),
                },
            };
            completed.push((job.done, result));
        }
        match txn.commit() {
            Ok(()) => {
                for (done, result) in completed {
                    let _ = done.send(result);
                }
            }
            Err(e) => {
                // A failed commit loses the whole batch, including individually
                // successful operations.
                let err = PoolError::Backend(format!("failed to commit write batch: {e}"));
                for (done, _) in completed {
                    let _ = done.send(Err(err.clone()));
                }
            }
        }
    }
}
