// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::used_underscore_binding
)]
#![allow(clippy::len_without_is_empty, clippy::new_without_default)]

use std::fmt;
use std::str::FromStr;

use sha2::digest::Digest as _;
use sha2::{Sha256, Sha512};

///
/// The widest digest any supported algorithm produces (SHA-512).
///
pub const MAX_FINGERPRINT_SIZE: usize = 64;

///
/// The content address of a chunk: the digest of its bytes under the pool's configured
/// hash algorithm. Stored inline so it is `Copy`; the unused tail is always zeroed, which
/// lets the derived equality, hashing and ordering operate on the whole buffer.
///
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    bytes: [u8; MAX_FINGERPRINT_SIZE],
    len: u8,
}

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Fingerprint, String> {
        if bytes.is_empty() || bytes.len() > MAX_FINGERPRINT_SIZE {
            return Err(format!(
                "A fingerprint must be between 1 and {MAX_FINGERPRINT_SIZE} bytes long: got {}",
                bytes.len()
            ));
        }
        let mut buf = [0; MAX_FINGERPRINT_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Fingerprint {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        match Fingerprint::from_bytes(bytes) {
            Ok(fingerprint) => fingerprint,
            Err(e) => panic!("Input value was not a fingerprint: {e}"),
        }
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string).map_err(|e| format!("{e:?}"))?;
        Fingerprint::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

///
/// The digest function a pool was created with. Changing it after creation would silently
/// orphan every stored chunk, so it is fixed at construction time.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    /// The width in bytes of fingerprints this algorithm produces.
    pub fn size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Fingerprint {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finish()
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::default()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::default()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> HashAlgorithm {
        HashAlgorithm::Sha256
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake3 => "blake3",
        };
        write!(f, "{name}")
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(format!("Unrecognized hash algorithm: {other}")),
        }
    }
}

///
/// An incremental fingerprint computation, for callers that assemble chunks from smaller
/// reads and do not want to buffer twice.
///
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finish(self) -> Fingerprint {
        match self {
            Hasher::Sha256(h) => Fingerprint::from_bytes_unsafe(h.finalize().as_slice()),
            Hasher::Sha512(h) => Fingerprint::from_bytes_unsafe(h.finalize().as_slice()),
            Hasher::Blake3(h) => Fingerprint::from_bytes_unsafe(h.finalize().as_bytes()),
        }
    }
}
