//! Block fingerprints.
//!
//! A fingerprint is the pair `(algorithm, hex digest)` computed over exactly
//! one block's bytes. Identical bytes always produce identical fingerprints,
//! which makes the fingerprint the deduplication key and (via its digest)
//! the storage name of the block.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Supported content hash functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    #[default]
    Sha512,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha512 => 128,
            HashAlgorithm::Sha256 => 64,
        }
    }

    /// Guess the algorithm of a bare hex digest from its length.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            128 => Some(HashAlgorithm::Sha512),
            64 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha512" => Ok(HashAlgorithm::Sha512),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(EngineError::Config(format!("unsupported hash algorithm: {other}"))),
        }
    }
}

/// Content fingerprint of one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockFingerprint {
    algorithm: HashAlgorithm,
    digest: String,
}

impl BlockFingerprint {
    /// Build a fingerprint from an algorithm and a hex digest.
    ///
    /// The digest is lowercased and checked for length and hex alphabet.
    pub fn new(algorithm: HashAlgorithm, digest: &str) -> Result<Self> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len()
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(EngineError::InvalidFingerprint(format!(
                "{algorithm}:{digest}"
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// Parse a bare hex digest, inferring the algorithm from its length.
    pub fn from_digest(digest: &str) -> Result<Self> {
        let digest = digest.trim();
        let algorithm = HashAlgorithm::from_digest_len(digest.len())
            .ok_or_else(|| EngineError::InvalidFingerprint(digest.to_string()))?;
        Self::new(algorithm, digest)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Name under which the block is stored on a data backend.
    pub fn storage_name(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for BlockFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl FromStr for BlockFingerprint {
    type Err = EngineError;

    /// Accepts `algorithm:digest` or a bare digest.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once(':') {
            Some((algo, digest)) => Self::new(algo.parse()?, digest),
            None => Self::from_digest(s),
        }
    }
}

impl Serialize for BlockFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes fingerprints with a fixed algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hasher {
    algorithm: HashAlgorithm,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn fingerprint(&self, data: &[u8]) -> BlockFingerprint {
        let digest = match self.algorithm {
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        };
        BlockFingerprint {
            algorithm: self.algorithm,
            digest,
        }
    }
}
