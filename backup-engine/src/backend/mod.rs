//! Storage backend abstraction.
//!
//! A backend is anything that can PUT, GET, LIST and DELETE opaque byte
//! payloads by name. Blocks are assumed to comfortably fit in memory, so the
//! interface deals in whole payloads rather than streams. Names may be long;
//! no backend truncates or rewrites them.
//!
//! Backends are composed from a URI of the form `scheme:identifier`. The
//! crypto and compression wrappers in [`crate::wrappers`] are layered on top
//! of the raw adapter by [`open_backend`], so callers always see plaintext
//! names and content.

pub mod directory;
pub mod http;
pub mod memory;

use crate::config::Config;
use crate::utils::errors::{EngineError, Result};
use crate::wrappers::{Compress, DataCrypto, NameCrypto};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

pub use directory::DirectoryBackend;
pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Minimal storage contract shared by adapters and wrappers.
///
/// Deleting or getting an absent name fails with [`EngineError::NotFound`].
/// Every implementation documents whether a single instance may be used
/// concurrently; all implementations in this crate allow it.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short human-readable description used in logs.
    fn describe(&self) -> String;

    async fn put(&self, name: &str, data: Bytes) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Bytes>;

    /// All names in this backend's namespace. Order is not guaranteed.
    async fn list(&self) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Box<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        (**self).put(name, data).await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        (**self).get(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        (**self).put(name, data).await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        (**self).get(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }
}

/// Backend schemes understood by [`open_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Directory,
    Http,
    Https,
}

/// A parsed `scheme:identifier` backend URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUri {
    pub scheme: Scheme,
    pub identifier: String,
}

impl FromStr for BackendUri {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, identifier) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidDescriptor(format!("missing scheme in '{s}'")))?;
        if identifier.is_empty() {
            return Err(EngineError::InvalidDescriptor(format!(
                "missing identifier in '{s}'"
            )));
        }
        let scheme = match scheme {
            "dir" | "file" => Scheme::Directory,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(EngineError::UnsupportedScheme(other.to_string())),
        };
        Ok(Self {
            scheme,
            identifier: identifier.to_string(),
        })
    }
}

impl fmt::Display for BackendUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Directory => "dir",
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{}:{}", scheme, self.identifier)
    }
}

/// `manifest-backend-uri,label,data-backend-uri`, used by persist and
/// materialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub manifest: BackendUri,
    pub label: String,
    pub data: BackendUri,
}

impl FromStr for Destination {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        let [manifest, label, data] = parts.as_slice() else {
            return Err(EngineError::InvalidDescriptor(format!(
                "expected 'manifest-uri,label,data-uri', got '{s}'"
            )));
        };
        let label = label.trim();
        crate::manifest::validate_label(label)?;
        Ok(Self {
            manifest: manifest.parse()?,
            label: label.to_string(),
            data: data.parse()?,
        })
    }
}

/// `manifest-backend-uri,data-backend-uri`, used by orphan listing and
/// garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPair {
    pub manifest: BackendUri,
    pub data: BackendUri,
}

impl FromStr for BackendPair {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        let [manifest, data] = parts.as_slice() else {
            return Err(EngineError::InvalidDescriptor(format!(
                "expected 'manifest-uri,data-uri', got '{s}'"
            )));
        };
        Ok(Self {
            manifest: manifest.parse()?,
            data: data.parse()?,
        })
    }
}

/// Build the raw adapter for a URI, without any wrappers.
pub fn open_raw_backend(uri: &BackendUri, config: &Config) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match uri.scheme {
        Scheme::Directory => Box::new(DirectoryBackend::new(&uri.identifier)),
        Scheme::Http | Scheme::Https => Box::new(HttpBackend::new(&uri.to_string(), &config.http)?),
    };
    Ok(backend)
}

/// Build the full backend stack for a URI.
///
/// With a crypto key configured the result is
/// `NameCrypto(DataCrypto(Compress?(raw)))`; without one it is
/// `Compress?(raw)`.
pub fn open_backend(uri: &BackendUri, config: &Config) -> Result<Box<dyn Backend>> {
    let mut backend = open_raw_backend(uri, config)?;

    if config.crypto.compression {
        backend = Box::new(Compress::new(backend, config.crypto.compression_level));
    }

    if let Some(key) = config.crypto.key.as_deref() {
        backend = Box::new(DataCrypto::new(backend, key)?);
        backend = Box::new(NameCrypto::new(backend, key));
    }

    debug!("Opened backend stack: {}", backend.describe());
    Ok(backend)
}
