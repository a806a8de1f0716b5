// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;

use crate::backend::memory::MemoryBackend;
use crate::error::PoolError;
use crate::filter::compression::{CompressionAlgorithm, Compressor};
use crate::filter::Handler;
use hashing::{Fingerprint, HashAlgorithm};
use task_executor::Executor;

fn fingerprint_of(data: &[u8]) -> Fingerprint {
    HashAlgorithm::Sha256.digest(data)
}

fn new_compressor(
    algorithm: CompressionAlgorithm,
    preset: Option<i32>,
) -> (Compressor, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let compressor = Compressor::new(backend.clone(), algorithm, preset, Executor::new());
    (compressor, backend)
}

const ALL: [CompressionAlgorithm; 6] = [
    CompressionAlgorithm::Gzip,
    CompressionAlgorithm::Xz,
    CompressionAlgorithm::Lz4,
    CompressionAlgorithm::Zstd,
    CompressionAlgorithm::Brotli,
    CompressionAlgorithm::Snappy,
];

#[tokio::test(flavor = "multi_thread")]
async fn every_codec_is_transparent() {
    // Compressible data, so the stored form differing from the original is observable.
    let data = b"the quick brown fox jumps over the lazy dog ".repeat(64);
    let fingerprint = fingerprint_of(&data);
    for algorithm in ALL {
        let (compressor, backend) = new_compressor(algorithm, None);
        compressor
            .put_chunk(fingerprint, Bytes::from(data.clone()))
            .await
            .unwrap();
        let loaded = compressor.get_chunk(fingerprint).await.unwrap();
        assert_eq!(&loaded[..], &data[..], "{algorithm} was not transparent");

        let stored = backend.raw_chunk(&fingerprint).unwrap();
        assert_ne!(&stored[..], &data[..], "{algorithm} stored plaintext");
        assert!(
            stored.len() < data.len(),
            "{algorithm} did not shrink repetitive data"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn presets_are_honored() {
    let data = b"presets presets presets presets ".repeat(128);
    let fingerprint = fingerprint_of(&data);
    let (fast, fast_backend) = new_compressor(CompressionAlgorithm::Zstd, Some(1));
    let (slow, slow_backend) = new_compressor(CompressionAlgorithm::Zstd, Some(19));
    fast.put_chunk(fingerprint, Bytes::from(data.clone()))
        .await
        .unwrap();
    slow.put_chunk(fingerprint, Bytes::from(data.clone()))
        .await
        .unwrap();
    let fast_size = fast_backend.raw_chunk(&fingerprint).unwrap().len();
    let slow_size = slow_backend.raw_chunk(&fingerprint).unwrap().len();
    assert!(slow_size <= fast_size);
}

#[tokio::test(flavor = "multi_thread")]
async fn fingerprints_pass_through_untouched() {
    let data = b"untouched".to_vec();
    let fingerprint = fingerprint_of(&data);
    let (compressor, backend) = new_compressor(CompressionAlgorithm::Lz4, None);
    compressor
        .put_chunk(fingerprint, Bytes::from(data))
        .await
        .unwrap();
    assert!(backend.contains(&fingerprint));
    assert!(compressor.has_chunk(fingerprint).await.unwrap());

    let mut stream = compressor.lister().await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), fingerprint);
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_stored_data_surfaces_as_a_filter_error() {
    let data = b"soon to be mangled".to_vec();
    let fingerprint = fingerprint_of(&data);
    let (compressor, backend) = new_compressor(CompressionAlgorithm::Gzip, None);
    compressor
        .put_chunk(fingerprint, Bytes::from(data))
        .await
        .unwrap();
    backend.replace_raw_chunk(fingerprint, Bytes::from_static(b"\x1f\x8b garbage"));
    let err = compressor.get_chunk(fingerprint).await.unwrap_err();
    assert!(matches!(err, PoolError::Filter(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_chunks_keep_their_not_found_error() {
    let (compressor, _) = new_compressor(CompressionAlgorithm::Snappy, None);
    let fingerprint = fingerprint_of(b"absent");
    assert_eq!(
        compressor.get_chunk(fingerprint).await.unwrap_err(),
        PoolError::NotFound(fingerprint)
    );
}

#[test]
fn algorithm_names_roundtrip() {
    for algorithm in ALL {
        assert_eq!(
            algorithm.to_string().parse::<CompressionAlgorithm>().unwrap(),
            algorithm
        );
    }
    assert!("rar".parse::<CompressionAlgorithm>().is_err());
}
