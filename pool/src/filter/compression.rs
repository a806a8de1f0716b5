// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PoolError;
use crate::filter::{CpuPool, FingerprintStream, Handler};
use hashing::Fingerprint;
use task_executor::Executor;

///
/// The codecs a pool may be configured with. The choice is not recorded in the chunks
/// themselves: a deployment must keep using the codec it was created with.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip,
    Xz,
    Lz4,
    Zstd,
    Brotli,
    Snappy,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Xz => "xz",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Brotli => "brotli",
            CompressionAlgorithm::Snappy => "snappy",
        };
        write!(f, "{name}")
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            "xz" => Ok(CompressionAlgorithm::Xz),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "brotli" => Ok(CompressionAlgorithm::Brotli),
            "snappy" => Ok(CompressionAlgorithm::Snappy),
            other => Err(format!("Unrecognized compression algorithm: {other}")),
        }
    }
}

///
/// Compresses values on the way down and decompresses on the way up, on the CPU pool.
/// Fingerprints, presence checks, deletes and listings pass through untouched.
///
pub struct Compressor {
    subordinate: Arc<dyn Handler>,
    algorithm: CompressionAlgorithm,
    preset: Option<i32>,
    cpu: CpuPool,
}

impl Compressor {
    pub fn new(
        subordinate: Arc<dyn Handler>,
        algorithm: CompressionAlgorithm,
        preset: Option<i32>,
        executor: Executor,
    ) -> Compressor {
        Compressor {
            subordinate,
            algorithm,
            preset,
            cpu: CpuPool::new(executor),
        }
    }
}

#[async_trait]
impl Handler for Compressor {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        self.subordinate.has_chunk(fingerprint).await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let compressed = self.subordinate.get_chunk(fingerprint).await?;
        let algorithm = self.algorithm;
        self.cpu
            .run(move || decompress(algorithm, &compressed).map(Bytes::from))
            .await
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        let algorithm = self.algorithm;
        let preset = self.preset;
        let compressed = self
            .cpu
            .run(move || compress(algorithm, preset, &value).map(Bytes::from))
            .await?;
        self.subordinate.put_chunk(fingerprint, compressed).await
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.subordinate.del_chunk(fingerprint).await
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        self.subordinate.lister().await
    }
}

fn compress(
    algorithm: CompressionAlgorithm,
    preset: Option<i32>,
    value: &[u8],
) -> Result<Vec<u8>, PoolError> {
    let failed = |e: &dyn fmt::Display| PoolError::Filter(format!("{algorithm} compression failed: {e}"));
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let level = preset
                .map(|p| flate2::Compression::new(p.clamp(0, 9) as u32))
                .unwrap_or_default();
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
            encoder.write_all(value).map_err(|e| failed(&e))?;
            encoder.finish().map_err(|e| failed(&e))
        }
        CompressionAlgorithm::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_compress(&mut &value[..], &mut out).map_err(|e| failed(&e))?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(value)),
        CompressionAlgorithm::Zstd => {
            zstd::stream::encode_all(value, preset.unwrap_or(0)).map_err(|e| failed(&e))
        }
        CompressionAlgorithm::Brotli => {
            let mut params = brotli::enc::BrotliEncoderParams::default();
            params.lgblock = 24;
            if let Some(preset) = preset {
                params.quality = preset;
            }
            let mut out = Vec::new();
            brotli::BrotliCompress(&mut &value[..], &mut out, &params).map_err(|e| failed(&e))?;
            Ok(out)
        }
        CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
            .compress_vec(value)
            .map_err(|e| failed(&e)),
    }
}

fn decompress(algorithm: CompressionAlgorithm, value: &[u8]) -> Result<Vec<u8>, PoolError> {
    let failed =
        |e: &dyn fmt::Display| PoolError::Filter(format!("{algorithm} decompression failed: {e}"));
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(value);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| failed(&e))?;
            Ok(out)
        }
        CompressionAlgorithm::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_decompress(&mut &value[..], &mut out).map_err(|e| failed(&e))?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => {
            lz4_flex::decompress_size_prepended(value).map_err(|e| failed(&e))
        }
        CompressionAlgorithm::Zstd => zstd::stream::decode_all(value).map_err(|e| failed(&e)),
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut &value[..], &mut out).map_err(|e| failed(&e))?;
            Ok(out)
        }
        CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
            .decompress_vec(value)
            .map_err(|e| failed(&e)),
    }
}
