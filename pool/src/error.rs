// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use hashing::Fingerprint;

///
/// Every failure the engine surfaces. Errors are `Clone` because a single failure can be
/// observed from several places: the action that caused it, the agent's sticky error slot,
/// and every job poisoned by a failed write batch.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// A get of a fingerprint that is not in the pool.
    NotFound(Fingerprint),
    /// The terminal storage failed: disk full, permissions, aborted transaction.
    Backend(String),
    /// Compression or encryption failed, including tampered ciphertext.
    Filter(String),
    /// Rejected at construction time: bad chunk size, key, or hash/cipher mismatch.
    Config(String),
    /// The caller misused an agent, e.g. submitted a write after an unrecovered error.
    Usage(String),
}

impl PoolError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::NotFound(fingerprint) => {
                write!(f, "chunk {fingerprint} does not exist in the pool")
            }
            PoolError::Backend(msg) => write!(f, "backend error: {msg}"),
            PoolError::Filter(msg) => write!(f, "filter error: {msg}"),
            PoolError::Config(msg) => write!(f, "configuration error: {msg}"),
            PoolError::Usage(msg) => write!(f, "usage error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Backend(err.to_string())
    }
}
