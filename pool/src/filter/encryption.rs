// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, AeadCore, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use futures::StreamExt;

use crate::error::PoolError;
use crate::filter::{CpuPool, FingerprintStream, Handler};
use hashing::Fingerprint;
use task_executor::Executor;

const AES_BLOCK_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;

///
/// Keeps the backend blind: fingerprints are permuted with AES-256 and values sealed
/// with XChaCha20-Poly1305, both under the same 32-byte key.
///
/// The fingerprint permutation is a bare block cipher in ECB mode. ECB is acceptable
/// here, and only here, because fingerprints are uniformly random and the permutation
/// must be deterministic: the same chunk has to map to the same backend key or
/// deduplication would break. Values get a fresh random nonce per put; two puts of the
/// same chunk may produce different ciphertexts, which is fine because the (permuted)
/// fingerprint is the identity.
///
pub struct Encryptor {
    subordinate: Arc<dyn Handler>,
    fingerprint_cipher: Aes256,
    value_cipher: XChaCha20Poly1305,
    cpu: CpuPool,
}

impl Encryptor {
    pub fn new(
        subordinate: Arc<dyn Handler>,
        key: &[u8],
        hash_size: usize,
        executor: Executor,
    ) -> Result<Encryptor, PoolError> {
        if key.len() != 32 {
            return Err(PoolError::Config(format!(
                "encryption key must be 32 bytes long, not {}",
                key.len()
            )));
        }
        if hash_size % AES_BLOCK_SIZE != 0 {
            return Err(PoolError::Config(format!(
                "hash size ({hash_size} bytes) is incompatible with the AES block size \
                 ({AES_BLOCK_SIZE} bytes)"
            )));
        }
        let key = GenericArray::clone_from_slice(key);
        Ok(Encryptor {
            subordinate,
            fingerprint_cipher: Aes256::new(&key),
            value_cipher: XChaCha20Poly1305::new(&key),
            cpu: CpuPool::new(executor),
        })
    }

    fn permute_fingerprint(&self, fingerprint: &Fingerprint) -> Fingerprint {
        let mut bytes = fingerprint.as_bytes().to_vec();
        for block in bytes.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.fingerprint_cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        Fingerprint::from_bytes_unsafe(&bytes)
    }
}

fn unpermute_fingerprint(cipher: &Aes256, fingerprint: &Fingerprint) -> Fingerprint {
    let mut bytes = fingerprint.as_bytes().to_vec();
    for block in bytes.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Fingerprint::from_bytes_unsafe(&bytes)
}

fn seal(cipher: &XChaCha20Poly1305, value: &[u8]) -> Result<Vec<u8>, PoolError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, value)
        .map_err(|e| PoolError::Filter(format!("failed to seal chunk: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(cipher: &XChaCha20Poly1305, value: &[u8]) -> Result<Vec<u8>, PoolError> {
    if value.len() < NONCE_SIZE {
        return Err(PoolError::Filter(
            "sealed chunk is too short to hold a nonce".to_owned(),
        ));
    }
    let (nonce, ciphertext) = value.split_at(NONCE_SIZE);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            PoolError::Filter("failed to open sealed chunk: wrong key or tampered data".to_owned())
        })
}

#[async_trait]
impl Handler for Encryptor {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        self.subordinate
            .has_chunk(self.permute_fingerprint(&fingerprint))
            .await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let sealed = self
            .subordinate
            .get_chunk(self.permute_fingerprint(&fingerprint))
            .await
            .map_err(|e| match e {
                // Report the caller's fingerprint, not the permuted one.
                PoolError::NotFound(_) => PoolError::NotFound(fingerprint),
                e => e,
            })?;
        let cipher = self.value_cipher.clone();
        self.cpu
            .run(move || open(&cipher, &sealed).map(Bytes::from))
            .await
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        let permuted = self.permute_fingerprint(&fingerprint);
        let cipher = self.value_cipher.clone();
        let sealed = self
            .cpu
            .run(move || seal(&cipher, &value).map(Bytes::from))
            .await?;
        self.subordinate.put_chunk(permuted, sealed).await
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.subordinate
            .del_chunk(self.permute_fingerprint(&fingerprint))
            .await
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        let stream = self.subordinate.lister().await?;
        let cipher = self.fingerprint_cipher.clone();
        Ok(stream
            .map(move |result| {
                result.map(|fingerprint| unpermute_fingerprint(&cipher, &fingerprint))
            })
            .boxed())
    }
}
