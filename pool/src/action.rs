// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::PoolError;
use crate::Chunk;
use hashing::Fingerprint;

///
/// One unit of work flowing through the pool: a get, has, put or del against a single
/// fingerprint. An action is completed exactly once, with either a result or an error,
/// and can be awaited by any number of holders of its handle.
///
/// `T` is the operation's result type: `Chunk` for gets, `bool` for presence checks and
/// `()` for writes and deletes.
///
pub struct PoolAction<T> {
    inner: Arc<ActionCell<T>>,
}

pub type GetAction = PoolAction<Chunk>;
pub type HasAction = PoolAction<bool>;
pub type PutAction = PoolAction<()>;
pub type DelAction = PoolAction<()>;

struct ActionCell<T> {
    fingerprint: Fingerprint,
    result: Mutex<Option<Result<T, PoolError>>>,
    done: watch::Sender<bool>,
}

impl<T> Clone for PoolAction<T> {
    fn clone(&self) -> Self {
        PoolAction {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> PoolAction<T> {
    pub(crate) fn new(fingerprint: Fingerprint) -> PoolAction<T> {
        let (done, _) = watch::channel(false);
        PoolAction {
            inner: Arc::new(ActionCell {
                fingerprint,
                result: Mutex::new(None),
                done,
            }),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    ///
    /// The action's outcome, if it has completed. Readahead consumers use this on the
    /// actions the pipeline hands back, which are complete by construction.
    ///
    pub fn result(&self) -> Option<Result<T, PoolError>> {
        self.inner.result.lock().clone()
    }

    ///
    /// Suspends until the action completes, then returns its outcome.
    ///
    pub async fn wait(&self) -> Result<T, PoolError> {
        let mut rx = self.inner.done.subscribe();
        // The cell holds the sender, so this can only resolve by completion.
        let _ = rx.wait_for(|done| *done).await;
        self.result()
            .expect("action signalled completion without a result")
    }

    pub(crate) fn complete(&self, result: Result<T, PoolError>) {
        *self.inner.result.lock() = Some(result);
        self.inner.done.send_replace(true);
    }
}
