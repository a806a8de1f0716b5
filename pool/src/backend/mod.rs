// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod filesystem;
pub mod lmdb;
pub mod memory;
pub mod rocks;

#[cfg(test)]
mod filesystem_tests;



use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::PoolError;
use hashing::Fingerprint;
use task_executor::Executor;

///
/// The base-64 alphabet of the on-disk pool layout: the standard alphabet with `/`
/// replaced by `_` so encoded fingerprints are path-safe, unpadded.
///
pub(crate) const POOL_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+_";

static POOL_B64: Lazy<base64::engine::GeneralPurpose> = Lazy::new(|| {
    let alphabet =
        base64::alphabet::Alphabet::new(POOL_ALPHABET).expect("static alphabet is well-formed");
    base64::engine::GeneralPurpose::new(&alphabet, base64::engine::general_purpose::NO_PAD)
});

pub(crate) fn encode_fingerprint(fingerprint: &Fingerprint) -> String {
    use base64::Engine;
    POOL_B64.encode(fingerprint.as_bytes())
}

pub(crate) fn decode_fingerprint(encoded: &str, hash_size: usize) -> Option<Fingerprint> {
    use base64::Engine;
    let bytes = POOL_B64.decode(encoded).ok()?;
    if bytes.len() != hash_size {
        return None;
    }
    Some(Fingerprint::from_bytes_unsafe(&bytes))
}

/// The position of a character in the pool alphabet, for decoded-byte-order sorting.
pub(crate) fn alphabet_position(c: char) -> Option<u32> {
    POOL_ALPHABET.find(c).map(|index| index as u32)
}

/// The unpadded base-64 length of a hash of the given width.
pub(crate) fn encoded_len(hash_size: usize) -> usize {
    (hash_size * 4 + 2) / 3
}

pub(crate) enum WriteOp {
    Put(Fingerprint, Bytes),
    Del(Fingerprint),
}

pub(crate) struct WriteJob {
    pub(crate) op: WriteOp,
    pub(crate) done: oneshot::Sender<Result<(), PoolError>>,
}

///
/// Applies one accumulated batch of write jobs in a single transaction, completing each
/// job's channel. A failure of the transaction itself must poison every job in the batch.
///
pub(crate) trait BatchApplier: Send + Sync + 'static {
    fn apply_batch(&self, batch: Vec<WriteJob>);
}

///
/// Coalesces concurrent puts and deletes into single write transactions. While a batch
/// is being committed, newly submitted jobs accumulate in the queue and are flushed as
/// one follow-up batch when the commit finishes, which bounds write-transaction churn
/// under load: at most one writer runs at a time, as LSM and LMDB stores require.
///
pub(crate) struct WriteBatcher<A> {
    applier: A,
    executor: Executor,
    state: Mutex<BatcherState>,
}

struct BatcherState {
    queue: Vec<WriteJob>,
    writing: bool,
}

impl<A: BatchApplier> WriteBatcher<A> {
    pub(crate) fn new(applier: A, executor: Executor) -> std::sync::Arc<WriteBatcher<A>> {
        std::sync::Arc::new(WriteBatcher {
            applier,
            executor,
            state: Mutex::new(BatcherState {
                queue: Vec::new(),
                writing: false,
            }),
        })
    }

    pub(crate) async fn submit(
        self: &std::sync::Arc<Self>,
        op: WriteOp,
    ) -> Result<(), PoolError> {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.queue.push(WriteJob { op, done });
            if !state.writing {
                state.writing = true;
                let batcher = self.clone();
                self.executor.native_spawn_blocking(move || batcher.run());
            }
        }
        rx.await
            .map_err(|_| PoolError::Backend("write batch worker dropped the operation".to_owned()))?
    }

    fn run(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    state.writing = false;
                    return;
                }
                std::mem::take(&mut state.queue)
            };
            log::trace!("committing a write batch of {} operation(s)", batch.len());
            self.applier.apply_batch(batch);
        }
    }
}
