// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tempfile::TempDir;

use crate::backend::encode_fingerprint;
use crate::backend::filesystem::FilesystemBackend;
use crate::error::PoolError;
use crate::filter::Handler;
use hashing::{Fingerprint, HashAlgorithm};
use task_executor::Executor;

fn new_backend(dir: &TempDir) -> Arc<FilesystemBackend> {
    Arc::new(FilesystemBackend::new(&dir.path().join("pool"), 32, 8, Executor::new()).unwrap())
}

fn fingerprint_of(data: &[u8]) -> Fingerprint {
    HashAlgorithm::Sha256.digest(data)
}

#[tokio::test(flavor = "multi_thread")]
async fn roundtrip() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let fingerprint = fingerprint_of(b"hello");
    backend
        .put_chunk(fingerprint, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(&backend.get_chunk(fingerprint).await.unwrap()[..], b"hello");
    assert!(backend.has_chunk(fingerprint).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn chunks_land_in_two_character_buckets() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let fingerprint = fingerprint_of(b"layout");
    backend
        .put_chunk(fingerprint, Bytes::from_static(b"layout"))
        .await
        .unwrap();

    let encoded = encode_fingerprint(&fingerprint);
    // 32 bytes of hash encode to 43 characters: 2 for the bucket, 41 for the file.
    assert_eq!(encoded.len(), 43);
    let path = dir.path().join("pool").join(&encoded[..2]).join(&encoded[2..]);
    assert_eq!(std::fs::read(path).unwrap(), b"layout");
}

#[tokio::test(flavor = "multi_thread")]
async fn put_is_idempotent_and_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let fingerprint = fingerprint_of(b"again");
    for _ in 0..3 {
        backend
            .put_chunk(fingerprint, Bytes::from_static(b"again"))
            .await
            .unwrap();
    }
    let encoded = encode_fingerprint(&fingerprint);
    let bucket = dir.path().join("pool").join(&encoded[..2]);
    let entries: Vec<_> = std::fs::read_dir(bucket)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec![encoded[2..].to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn get_of_missing_chunk_is_not_found() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let fingerprint = fingerprint_of(b"missing");
    assert_eq!(
        backend.get_chunk(fingerprint).await.unwrap_err(),
        PoolError::NotFound(fingerprint)
    );
    assert!(!backend.has_chunk(fingerprint).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn del_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let fingerprint = fingerprint_of(b"going");
    backend
        .put_chunk(fingerprint, Bytes::from_static(b"going"))
        .await
        .unwrap();
    backend.del_chunk(fingerprint).await.unwrap();
    backend.del_chunk(fingerprint).await.unwrap();
    assert!(!backend.has_chunk(fingerprint).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn lister_yields_sorted_fingerprints_and_skips_foreign_files() {
    let dir = TempDir::new().unwrap();
    let backend = new_backend(&dir);
    let mut expected = Vec::new();
    for i in 0..50_u32 {
        let data = format!("list-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        backend
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        expected.push(fingerprint);
    }
    expected.sort();

    // Stray files that do not match the layout grammar are ignored.
    std::fs::write(dir.path().join("pool").join("stray"), b"junk").unwrap();
    std::fs::create_dir(dir.path().join("pool").join("not-a-bucket")).unwrap();

    let mut listed = Vec::new();
    let mut stream = backend.lister().await.unwrap();
    while let Some(item) = stream.next().await {
        listed.push(item.unwrap());
    }
    assert_eq!(listed, expected);
}
