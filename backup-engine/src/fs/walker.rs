//! Directory traversal for persistence and verification.
//!
//! Entries come out in a stable order: names sorted lexicographically,
//! parents before their children. The root itself is not yielded and
//! symlinks are never followed.

use super::metadata::FileMetaData;
use super::pathname;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// One node discovered during walking
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Full path to the node
    pub path: PathBuf,

    /// Path relative to the root, `/`-separated, in [`pathname`] form
    pub relative_path: String,

    pub metadata: FileMetaData,

    pub depth: usize,
}

impl WalkEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> Result<Self> {
        let path = entry.path().to_path_buf();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let relative_path = pathname::encode(relative.as_os_str());

        Ok(Self {
            metadata: FileMetaData::from_path(&path)?,
            path,
            relative_path,
            depth: entry.depth(),
        })
    }
}

/// Walk `root` and collect every node below it.
pub fn walk_directory(root: &Path) -> Result<Vec<WalkEntry>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        entries.push(WalkEntry::from_entry(&entry, root)?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn relative_paths(entries: &[WalkEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = walk_directory(temp_dir.path())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_order_is_stable_and_parents_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("b"))?;
        fs::write(temp_dir.path().join("b/inner.txt"), b"x")?;
        fs::write(temp_dir.path().join("c.txt"), b"c")?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;

        let entries = walk_directory(temp_dir.path())?;
        assert_eq!(relative_paths(&entries), vec!["a.txt", "b", "b/inner.txt", "c.txt"]);
        assert!(entries[1].metadata.is_directory());
        assert_eq!(entries[2].depth, 2);
        Ok(())
    }

    #[test]
    fn test_symlinks_are_not_followed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("real"))?;
        fs::write(temp_dir.path().join("real/file"), b"x")?;
        std::os::unix::fs::symlink("real", temp_dir.path().join("link"))?;

        let entries = walk_directory(temp_dir.path())?;
        assert_eq!(relative_paths(&entries), vec!["link", "real", "real/file"]);
        assert!(entries[0].metadata.is_symlink());
        Ok(())
    }

    #[test]
    fn test_non_utf8_names_are_kept() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(OsStr::from_bytes(b"caf\xe9.txt")), b"x")?;
        fs::write(temp_dir.path().join("ok.txt"), b"y")?;

        let entries = walk_directory(temp_dir.path())?;
        assert_eq!(relative_paths(&entries), vec!["caf\\xe9.txt", "ok.txt"]);
        Ok(())
    }
}
