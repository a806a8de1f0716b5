// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::PoolError;
use crate::filter::compression::CompressionAlgorithm;
use hashing::HashAlgorithm;

pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_WORKERS: usize = 32;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_MAX_READAHEADS: usize = 32;

/// Which terminal storage a pool is built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Lmdb,
    Rocks,
    Memory,
}

///
/// Everything the engine consumes from configuration, with the defaults the original
/// deployment shipped. `validate` is called by `Pool::new`, so hand-built configs get the
/// same checks as parsed ones.
///
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum chunk length in bytes. Must be a power of two.
    pub chunk_size: usize,
    /// The content-address digest. Fixed for the lifetime of the pool.
    pub hash: HashAlgorithm,
    /// Bound on concurrently executing backend jobs per backend instance.
    pub max_workers: usize,
    /// Pool-wide bound on in-flight operations.
    pub max_queue_depth: usize,
    /// Per-agent bound on the readahead window.
    pub max_readaheads: usize,
    /// Directory of the filesystem/LMDB/RocksDB store, relative to the pool root.
    pub pooldir: PathBuf,
    pub storage: StorageKind,
    pub compression: Option<CompressionAlgorithm>,
    pub compression_preset: Option<i32>,
    /// 32-byte symmetric key; enables the encryption filter when set.
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash: HashAlgorithm::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_readaheads: DEFAULT_MAX_READAHEADS,
            pooldir: PathBuf::from("pool"),
            storage: StorageKind::Filesystem,
            compression: None,
            compression_preset: None,
            encryption_key: None,
        }
    }
}

impl PoolConfig {
    ///
    /// Builds a config from the opaque key/value map the surrounding system hands us.
    /// Unknown keys are ignored; they belong to other subsystems.
    ///
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<PoolConfig, PoolError> {
        let mut config = PoolConfig::default();
        if let Some(value) = map.get("chunk_size") {
            config.chunk_size = parse_usize("chunk_size", value)?;
        }
        if let Some(value) = map.get("hash_algo") {
            config.hash = value.parse().map_err(PoolError::Config)?;
        }
        if let Some(value) = map.get("max_workers") {
            config.max_workers = parse_usize("max_workers", value)?;
        }
        if let Some(value) = map.get("max_queue_depth") {
            config.max_queue_depth = parse_usize("max_queue_depth", value)?;
        }
        if let Some(value) = map.get("pool_max_readaheads") {
            config.max_readaheads = parse_usize("pool_max_readaheads", value)?;
        }
        if let Some(value) = map.get("pooldir") {
            config.pooldir = PathBuf::from(value);
        }
        if let Some(value) = map.get("pool_storage") {
            config.storage = match value.to_ascii_lowercase().as_str() {
                "filesystem" => StorageKind::Filesystem,
                "lmdb" => StorageKind::Lmdb,
                "rocksdb" | "rocks" => StorageKind::Rocks,
                "memory" => StorageKind::Memory,
                other => {
                    return Err(PoolError::Config(format!(
                        "unrecognized pool_storage {other:?}"
                    )))
                }
            };
        }
        if let Some(value) = map.get("pool_compression") {
            config.compression = Some(value.parse().map_err(PoolError::Config)?);
        }
        if let Some(value) = map.get("pool_compression_preset") {
            let preset = value.parse::<i32>().map_err(|e| {
                PoolError::Config(format!("pool_compression_preset must be an integer: {e}"))
            })?;
            config.compression_preset = Some(preset);
        }
        if let Some(value) = map.get("pool_encryption_key") {
            let key = STANDARD.decode(value).map_err(|e| {
                PoolError::Config(format!("pool_encryption_key is not valid base64: {e}"))
            })?;
            config.encryption_key = Some(key);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(PoolError::Config(format!(
                "chunk_size must be a power of two: got {}",
                self.chunk_size
            )));
        }
        if self.max_workers == 0 {
            return Err(PoolError::Config(
                "max_workers must be strictly positive".to_owned(),
            ));
        }
        if self.max_queue_depth == 0 {
            return Err(PoolError::Config(
                "max_queue_depth must be strictly positive".to_owned(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            if key.len() != 32 {
                return Err(PoolError::Config(format!(
                    "encryption key must be 32 bytes long, not {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, PoolError> {
    let parsed = value
        .parse::<usize>()
        .map_err(|e| PoolError::Config(format!("{key} must be a positive integer: {e}")))?;
    if parsed == 0 {
        return Err(PoolError::Config(format!(
            "{key} must be strictly positive"
        )));
    }
    Ok(parsed)
}
