//! Local directory backend.
//!
//! Each name maps to one file under the root directory. Names longer than
//! [`MAX_COMPONENT`] bytes are split into nested `<segment>.seg`
//! directories so that arbitrarily long names (encrypted block names are
//! close to 300 characters) stay within filesystem limits. A segment
//! directory name is always longer than [`MAX_COMPONENT`], so it can never
//! collide with a plain file name.
//!
//! Writes go to a hidden temporary file in the target directory, are
//! fsynced and then renamed into place, so a crash never leaves a partially
//! written object under a real name. Temporary files are hidden from
//! listings.
//!
//! A single instance is safe for concurrent use; every operation runs on
//! the blocking thread pool.

use super::Backend;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of files owned by the backend itself.
const HIDDEN_PREFIX: &str = ".backup-engine-tmp.";

/// Longest name stored as a single file
const MAX_COMPONENT: usize = 200;

const SEGMENT_SUFFIX: &str = ".seg";

#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the root directory if it does not exist yet.
    pub fn create(&self) -> Result<()> {
        if !self.exists() {
            info!("Creating backend directory {}", self.root.display());
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Reject names that would escape the root or collide with temp files.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains('\0') {
            return Err(EngineError::InvalidName(name.to_string()));
        }

        let mut path = self.root.clone();
        let mut rest = name;
        while rest.len() > MAX_COMPONENT {
            let mut cut = MAX_COMPONENT;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            path.push(format!("{}{}", &rest[..cut], SEGMENT_SUFFIX));
            rest = &rest[cut..];
        }

        if rest == "." || rest == ".." || rest.starts_with(HIDDEN_PREFIX) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        path.push(rest);
        Ok(path)
    }
}

fn collect_names(dir: &Path, prefix: &str, names: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if file_name.len() > MAX_COMPONENT {
                if let Some(segment) = file_name.strip_suffix(SEGMENT_SUFFIX) {
                    collect_names(&entry.path(), &format!("{prefix}{segment}"), names)?;
                }
            }
        } else if file_type.is_file() && !file_name.starts_with(HIDDEN_PREFIX) {
            names.push(format!("{prefix}{file_name}"));
        }
    }
    Ok(())
}

fn map_not_found(err: std::io::Error, name: &str) -> EngineError {
    if err.kind() == ErrorKind::NotFound {
        EngineError::NotFound(name.to_string())
    } else {
        EngineError::BackendIo(format!("{name}: {err}"))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::BackendIo(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl Backend for DirectoryBackend {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(name)?;
        let this = self.clone();
        let name = name.to_string();

        blocking(move || {
            this.create()?;
            debug!("Putting {} ({} bytes)", name, data.len());

            let parent = path.parent().unwrap_or(this.root.as_path());
            fs::create_dir_all(parent)?;
            let mut tmp = tempfile::Builder::new()
                .prefix(HIDDEN_PREFIX)
                .tempfile_in(parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.resolve(name)?;
        let name = name.to_string();

        blocking(move || {
            debug!("Getting {}", name);
            fs::read(&path)
                .map(Bytes::from)
                .map_err(|e| map_not_found(e, &name))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();

        blocking(move || {
            if !root.is_dir() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            collect_names(&root, "", &mut names)?;
            Ok(names)
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        let root = self.root.clone();
        let name = name.to_string();

        blocking(move || {
            debug!("Deleting {}", name);
            fs::remove_file(&path).map_err(|e| map_not_found(e, &name))?;

            // Drop segment directories left empty; stops at the first
            // non-empty one.
            let mut dir = path.parent();
            while let Some(d) = dir.filter(|d| *d != root.as_path()) {
                if fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PREFIX: &str = "unittest_";

    #[tokio::test]
    async fn test_backend_contract() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = DirectoryBackend::new(temp_dir.path().join("store"));
        assert!(backend.list().await?.is_empty());

        backend.put("x", Bytes::from_static(b"data")).await?;
        assert_eq!(backend.list().await?, vec!["x".to_string()]);
        assert_eq!(backend.get("x").await?, Bytes::from_static(b"data"));

        backend.delete("x").await?;
        assert!(backend.list().await?.is_empty());
        assert!(backend.delete("x").await.unwrap_err().is_not_found());
        assert!(backend.get("x").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_large_and_long_names() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = DirectoryBackend::new(temp_dir.path());

        backend.put("empty", Bytes::new()).await?;
        assert!(backend.get("empty").await?.is_empty());

        let mbyte = Bytes::from(vec![b'x'; 1024 * 1024]);
        backend.put("large", mbyte.clone()).await?;
        assert_eq!(backend.get("large").await?, mbyte);

        let long_name = format!("{PREFIX}{}", "a".repeat(200));
        backend.put(&long_name, Bytes::from_static(b"data")).await?;
        assert!(backend.list().await?.contains(&long_name));
        Ok(())
    }

    #[tokio::test]
    async fn test_names_beyond_filesystem_limits() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = DirectoryBackend::new(temp_dir.path());

        let short = "s".repeat(MAX_COMPONENT);
        let long = "l".repeat(1000);
        let sibling = format!("{}{}", "l".repeat(MAX_COMPONENT), "other");
        // Multi-byte characters must not be split.
        let unicode = "\u{e9}".repeat(300);
        for name in [&short, &long, &sibling, &unicode] {
            backend.put(name, Bytes::from(name.clone())).await?;
        }

        let mut listed = backend.list().await?;
        listed.sort();
        let mut expected = vec![short.clone(), long.clone(), sibling.clone(), unicode.clone()];
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(backend.get(&long).await?, Bytes::from(long.clone()));
        assert_eq!(backend.get(&unicode).await?, Bytes::from(unicode.clone()));

        backend.delete(&long).await?;
        backend.delete(&sibling).await?;
        backend.delete(&unicode).await?;
        assert_eq!(backend.list().await?, vec![short]);
        // Emptied segment directories are removed as well.
        assert_eq!(fs::read_dir(temp_dir.path())?.count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_many_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = DirectoryBackend::new(temp_dir.path());

        for n in 0..200 {
            let name = format!("{PREFIX}fnumber_{n}");
            backend.put(&name, Bytes::from(name.clone())).await?;
        }
        let listed = backend.list().await?;
        assert_eq!(listed.len(), 200);
        for n in 0..200 {
            let name = format!("{PREFIX}fnumber_{n}");
            assert_eq!(backend.get(&name).await?, Bytes::from(name.clone()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let temp_dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(temp_dir.path());

        for name in ["", "..", "a/b", "a\\b", ".backup-engine-tmp.x"] {
            assert!(matches!(
                backend.put(name, Bytes::new()).await,
                Err(EngineError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_hidden_temp_files_not_listed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(".backup-engine-tmp.stale"), b"junk")?;
        let backend = DirectoryBackend::new(temp_dir.path());
        backend.put("real", Bytes::from_static(b"1")).await?;
        assert_eq!(backend.list().await?, vec!["real".to_string()]);
        Ok(())
    }
}
