// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{alphabet_position, decode_fingerprint, encode_fingerprint, encoded_len};
use crate::error::PoolError;
use crate::filter::{FingerprintStream, Handler};
use hashing::Fingerprint;
use task_executor::Executor;

///
/// Chunks as plain files: a fingerprint is base-64 encoded and split into a two
/// character bucket directory and a file name, so no directory ever holds more than a
/// 1/4096th of the pool. Writes go to a temporary file that is fsynced and then
/// hard-linked into place, which makes puts atomic and idempotent: losing the link race
/// means somebody else stored the same chunk.
///
pub struct FilesystemBackend {
    pooldir: PathBuf,
    hash_size: usize,
    executor: Executor,
    io_permits: Arc<Semaphore>,
}

impl FilesystemBackend {
    pub fn new(
        pooldir: &Path,
        hash_size: usize,
        max_workers: usize,
        executor: Executor,
    ) -> Result<FilesystemBackend, PoolError> {
        std::fs::create_dir_all(pooldir)
            .map_err(|e| PoolError::Backend(format!("failed to create {pooldir:?}: {e}")))?;
        log::trace!("initialized filesystem pool at {pooldir:?}");
        Ok(FilesystemBackend {
            pooldir: pooldir.to_owned(),
            hash_size,
            executor,
            io_permits: Arc::new(Semaphore::new(max_workers)),
        })
    }

    fn chunk_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let encoded = encode_fingerprint(fingerprint);
        self.pooldir.join(&encoded[..2]).join(&encoded[2..])
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        self.io_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PoolError::Backend(format!("worker pool is shut down: {e}")))
    }

    async fn io<R, F>(&self, f: F) -> Result<R, PoolError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, PoolError> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.executor
            .spawn_blocking(
                move || {
                    let _permit = permit;
                    f()
                },
                |e| Err(PoolError::Backend(format!("I/O task failed: {e}"))),
            )
            .await
    }
}

#[async_trait]
impl Handler for FilesystemBackend {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        let path = self.chunk_path(&fingerprint);
        self.io(move || Ok(path.exists())).await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let path = self.chunk_path(&fingerprint);
        self.io(move || match std::fs::read(&path) {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PoolError::NotFound(fingerprint))
            }
            Err(e) => Err(PoolError::Backend(format!("failed to read {path:?}: {e}"))),
        })
        .await
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        let path = self.chunk_path(&fingerprint);
        self.io(move || {
            if path.exists() {
                return Ok(());
            }
            let bucket_dir = path.parent().expect("chunk paths have a parent").to_owned();
            let result = match store_file(&bucket_dir, &path, &value) {
                // The bucket directory is created on first use.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    std::fs::create_dir_all(&bucket_dir).and_then(|()| {
                        store_file(&bucket_dir, &path, &value)
                    })
                }
                result => result,
            };
            result.map_err(|e| PoolError::Backend(format!("failed to store {path:?}: {e}")))
        })
        .await
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        let path = self.chunk_path(&fingerprint);
        self.io(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::Backend(format!("failed to remove {path:?}: {e}"))),
        })
        .await
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        let pooldir = self.pooldir.clone();
        let buckets = self
            .io(move || {
                let mut buckets = Vec::new();
                let entries = std::fs::read_dir(&pooldir)
                    .map_err(|e| PoolError::Backend(format!("failed to list {pooldir:?}: {e}")))?;
                for entry in entries {
                    let entry = entry
                        .map_err(|e| PoolError::Backend(format!("failed to list {pooldir:?}: {e}")))?;
                    if let Ok(name) = entry.file_name().into_string() {
                        if bucket_sort_key(&name).is_some() {
                            buckets.push(name);
                        }
                    }
                }
                buckets.sort_by_key(|name| bucket_sort_key(name));
                Ok(buckets)
            })
            .await?;

        // One bucket at a time on a worker thread; a bounded channel paces the scan to
        // the consumer.
        let (tx, mut rx) = mpsc::channel::<Result<Vec<Fingerprint>, PoolError>>(1);
        let pooldir = self.pooldir.clone();
        let hash_size = self.hash_size;
        self.executor.native_spawn_blocking(move || {
            for bucket in buckets {
                let batch = list_bucket(&pooldir, &bucket, hash_size);
                let failed = batch.is_err();
                if tx.blocking_send(batch).is_err() || failed {
                    return;
                }
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

///
/// Writes the chunk next to its destination and hard-links it into place. An existing
/// link target means a concurrent (or previous) put of the same chunk won; that is
/// success. On Linux the data never appears under a temporary name at all: it lives in
/// an anonymous inode until the final link.
///
fn store_file(bucket_dir: &Path, target: &Path, value: &[u8]) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if store_file_anonymous(bucket_dir, target, value)? {
            return Ok(());
        }
    }
    let tmp = tempfile::Builder::new()
        .prefix(&format!("tmp-{}-", std::process::id()))
        .rand_bytes(32)
        .tempfile_in(bucket_dir)?;
    let mut file = tmp.as_file();
    file.write_all(value)?;
    file.sync_all()?;
    match std::fs::hard_link(tmp.path(), target) {
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        result => result,
    }
}

///
/// `O_TMPFILE` put: write and fsync an anonymous inode in the bucket directory, then
/// link it into place through /proc/self/fd. Returns false when the filesystem does not
/// support anonymous inodes, so the caller can fall back to a named temporary file.
///
#[cfg(target_os = "linux")]
fn store_file_anonymous(
    bucket_dir: &Path,
    target: &Path,
    value: &[u8],
) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use nix::unistd::LinkatFlags;

    fn os_err(errno: Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(errno as i32)
    }

    struct TmpFd(std::os::unix::io::RawFd);
    impl Drop for TmpFd {
        fn drop(&mut self) {
            let _ = nix::unistd::close(self.0);
        }
    }

    let fd = match nix::fcntl::open(
        bucket_dir,
        OFlag::O_TMPFILE | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o440),
    ) {
        Ok(fd) => TmpFd(fd),
        Err(Errno::EOPNOTSUPP) | Err(Errno::EINVAL) | Err(Errno::EISDIR) => return Ok(false),
        Err(e) => return Err(os_err(e)),
    };

    let mut written = 0;
    while written < value.len() {
        match nix::unistd::write(fd.0, &value[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(os_err(e)),
        }
    }
    nix::unistd::fsync(fd.0).map_err(os_err)?;

    let proc_path = format!("/proc/self/fd/{}", fd.0);
    match nix::unistd::linkat(
        None,
        proc_path.as_str(),
        None,
        target,
        LinkatFlags::SymlinkFollow,
    ) {
        Ok(()) | Err(Errno::EEXIST) => Ok(true),
        Err(e) => Err(os_err(e)),
    }
}

/// Bucket names sort by their decoded bits, not codepoints: a 12-bit key per directory.
fn bucket_sort_key(name: &str) -> Option<u32> {
    let mut chars = name.chars();
    let (first, second) = (chars.next()?, chars.next()?);
    if chars.next().is_some() {
        return None;
    }
    Some(alphabet_position(first)? << 6 | alphabet_position(second)?)
}

fn list_bucket(
    pooldir: &Path,
    bucket: &str,
    hash_size: usize,
) -> Result<Vec<Fingerprint>, PoolError> {
    let bucket_dir = pooldir.join(bucket);
    let entries = std::fs::read_dir(&bucket_dir)
        .map_err(|e| PoolError::Backend(format!("failed to list {bucket_dir:?}: {e}")))?;
    let file_name_len = encoded_len(hash_size) - 2;
    let mut batch = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| PoolError::Backend(format!("failed to list {bucket_dir:?}: {e}")))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.len() != file_name_len || !name.chars().all(|c| alphabet_position(c).is_some()) {
            continue;
        }
        if let Some(fingerprint) = decode_fingerprint(&format!("{bucket}{name}"), hash_size) {
            batch.push(fingerprint);
        }
    }
    batch.sort();
    Ok(batch)
}
