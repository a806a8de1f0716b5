// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::error::PoolError;
use crate::filter::{FingerprintStream, Handler};
use hashing::Fingerprint;

///
/// An in-process backend: a sorted map behind a mutex. Useful for tests and for
/// embedders that want pool semantics without persistence.
///
pub struct MemoryBackend {
    chunks: Mutex<BTreeMap<Fingerprint, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    /// The number of stored chunks; dedup tests assert on this.
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.chunks.lock().contains_key(fingerprint)
    }

    /// Raw stored bytes, bypassing any filters above: tamper tests patch these.
    pub fn raw_chunk(&self, fingerprint: &Fingerprint) -> Option<Bytes> {
        self.chunks.lock().get(fingerprint).cloned()
    }

    pub fn replace_raw_chunk(&self, fingerprint: Fingerprint, value: Bytes) {
        self.chunks.lock().insert(fingerprint, value);
    }

    pub fn raw_fingerprints(&self) -> Vec<Fingerprint> {
        self.chunks.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Handler for MemoryBackend {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        Ok(self.chunks.lock().contains_key(&fingerprint))
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        self.chunks
            .lock()
            .get(&fingerprint)
            .cloned()
            .ok_or(PoolError::NotFound(fingerprint))
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        self.chunks.lock().entry(fingerprint).or_insert(value);
        Ok(())
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.chunks.lock().remove(&fingerprint);
        Ok(())
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        let fingerprints: Vec<Fingerprint> = self.chunks.lock().keys().copied().collect();
        Ok(futures::stream::iter(fingerprints.into_iter().map(Ok)).boxed())
    }
}
