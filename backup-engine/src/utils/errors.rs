//! Error types for the backup engine.

use crate::hash::BlockFingerprint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Manifest label already exists: {0}")]
    DuplicateLabel(String),

    #[error("Crypto integrity error: {0}")]
    CryptoIntegrity(String),

    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("{} block upload(s) failed", failed.len())]
    AggregateUpload { failed: Vec<BlockFingerprint> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid block fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Verification failed: {0} difference(s)")]
    VerifyMismatch(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// True for errors that mean "the name or label does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
