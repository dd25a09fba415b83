//! Backup engines - persist a tree, materialize it back, verify it.
//!
//! This module ties together the walker, the hasher, the storage queue and
//! the manifest:
//! - [`persist`]: tree -> blocks -> queue -> manifest
//! - [`materialize`]: manifest -> queue -> tree
//! - [`verify`]: tree vs. manifest (and optionally vs. the data backend)

pub mod materialize;
pub mod persist;
pub mod verify;

pub use materialize::{materialize, MaterializeReport};
pub use persist::{persist, seed_skip_set, PersistReport};
pub use verify::{verify, Difference, VerifyReport};

use crate::fs::walker::{walk_directory, WalkEntry};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Reads a file as a sequence of `block_size` blocks; only the last one
/// may be shorter.
pub(crate) struct BlockReader {
    file: File,
    block_size: usize,
}

impl BlockReader {
    pub async fn open(path: &Path, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(EngineError::Config("block_size must be greater than 0".into()));
        }
        Ok(Self {
            file: File::open(path).await?,
            block_size,
        })
    }

    /// Next full block, or `None` at end of file.
    pub async fn next_block(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        // A single read may return less than asked for well before EOF.
        while filled < self.block_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Walk `root` on the blocking pool.
pub(crate) async fn walk(root: &Path) -> Result<Vec<WalkEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_directory(&root))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_block_reader_splits_exactly() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"abcdefghij")?;

        let mut reader = BlockReader::open(&path, 4).await?;
        let mut blocks = Vec::new();
        while let Some(block) = reader.next_block().await? {
            blocks.push(block);
        }
        assert_eq!(blocks, vec![&b"abcd"[..], &b"efgh"[..], &b"ij"[..]]);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_reader_empty_file_has_no_blocks() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("empty");
        std::fs::write(&path, b"")?;

        let mut reader = BlockReader::open(&path, 4).await?;
        assert!(reader.next_block().await?.is_none());
        Ok(())
    }
}
