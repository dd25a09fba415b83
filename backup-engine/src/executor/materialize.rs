//! Materialization engine - recreate a tree from a manifest.
//!
//! Directories are created first, then files are written with their blocks
//! fetched and appended in manifest order, then symlinks. Metadata is
//! applied last, directories deepest-first so creating children does not
//! bump a parent's mtime afterwards. A partially restored destination is
//! left in place on error.

use crate::config::MaterializeOptions;
use crate::fs::metadata::FileKind;
use crate::fs::pathname;
use crate::manifest::{Manifest, ManifestEntry};
use crate::queue::StorageQueue;
use crate::utils::errors::{EngineError, Result};
use futures_util::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Materialize execution result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    /// FIFOs, devices and sockets, which are not recreated
    pub skipped: usize,
    pub bytes: u64,
    pub blocks_fetched: usize,
    pub duration: Duration,
}

/// Restore `manifest` (or the parts selected by `options.filters`) below
/// `destination`.
pub async fn materialize(
    manifest: &Manifest,
    queue: &StorageQueue,
    destination: &Path,
    options: &MaterializeOptions,
) -> Result<MaterializeReport> {
    let start_time = Instant::now();
    let selected = select_entries(manifest, &options.filters)
        .into_iter()
        .map(|entry| relative_target(&entry.path).map(|relative| (entry, relative)))
        .collect::<Result<Vec<_>>>()?;
    info!(
        "Materializing {} of {} entries from {} into {}",
        selected.len(),
        manifest.entries.len(),
        manifest.label,
        destination.display()
    );

    fs::create_dir_all(destination).await?;
    let mut report = MaterializeReport::default();

    for (entry, relative) in &selected {
        if entry.metadata.is_directory() {
            fs::create_dir_all(destination.join(relative)).await?;
            report.directories += 1;
        }
    }

    for (entry, relative) in &selected {
        let target = destination.join(relative);
        match entry.metadata.kind() {
            FileKind::Directory => {}
            FileKind::Regular => {
                let written = write_file(entry, queue, &target).await?;
                report.files += 1;
                report.bytes += written;
                report.blocks_fetched += entry.blocks.len();
            }
            FileKind::Symlink => {
                let link_target = entry.metadata.symlink_target().ok_or_else(|| {
                    EngineError::InvalidManifest(format!("{}: symlink without target", entry.path))
                })?;
                ensure_parent(&target).await?;
                fs::symlink(pathname::decode(link_target)?, &target).await?;
                report.symlinks += 1;
            }
            other => {
                warn!("Skipping special node {} ({:?})", entry.path, other);
                report.skipped += 1;
            }
        }
    }

    if options.apply_metadata {
        apply_metadata(&selected, destination);
    }

    report.duration = start_time.elapsed();
    info!(
        "Materialize complete: {} files, {} directories, {} symlinks, {} bytes",
        report.files, report.directories, report.symlinks, report.bytes
    );
    Ok(report)
}

/// Entries matching a filter exactly or lying below a filtered directory.
fn select_entries<'a>(manifest: &'a Manifest, filters: &[String]) -> Vec<&'a ManifestEntry> {
    if filters.is_empty() {
        return manifest.entries.iter().collect();
    }
    let filters: Vec<&str> = filters
        .iter()
        .map(|f| f.trim_start_matches("./").trim_end_matches('/'))
        .collect();

    manifest
        .entries
        .iter()
        .filter(|e| {
            filters.iter().any(|f| {
                e.path == *f
                    || e.path
                        .strip_prefix(f)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        })
        .collect()
}

/// Decode a manifest path; it must stay below the destination.
fn relative_target(path: &str) -> Result<PathBuf> {
    let decoded = pathname::decode(path)?;
    let escapes = decoded.as_os_str().is_empty()
        || decoded
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(EngineError::InvalidManifest(format!(
            "refusing to materialize path '{path}'"
        )));
    }
    Ok(decoded)
}

async fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn write_file(entry: &ManifestEntry, queue: &StorageQueue, target: &Path) -> Result<u64> {
    ensure_parent(target).await?;
    debug!("Writing {} ({} blocks)", entry.path, entry.blocks.len());

    let mut file = fs::File::create(target).await?;
    let mut written = 0u64;
    let mut blocks = std::pin::pin!(queue.fetch_stream(&entry.blocks));
    while let Some(block) = blocks.next().await {
        let block = block?;
        file.write_all(&block).await?;
        written += block.len() as u64;
    }
    file.flush().await?;

    if let Some(expected) = entry.metadata.size() {
        if expected != written {
            return Err(EngineError::InvalidManifest(format!(
                "{}: blocks add up to {} bytes, manifest says {}",
                entry.path, written, expected
            )));
        }
    }
    Ok(written)
}

fn apply_metadata(entries: &[(&ManifestEntry, PathBuf)], destination: &Path) {
    let (mut dirs, others): (Vec<_>, Vec<_>) =
        entries.iter().partition(|(e, _)| e.metadata.is_directory());

    for (entry, relative) in others {
        if matches!(entry.metadata.kind(), FileKind::Regular | FileKind::Symlink) {
            apply_one(entry, &destination.join(relative));
        }
    }

    dirs.sort_by_key(|(_, relative)| std::cmp::Reverse(relative.components().count()));
    for (entry, relative) in dirs {
        apply_one(entry, &destination.join(relative));
    }
}

fn apply_one(entry: &ManifestEntry, target: &Path) {
    if let Err(e) = entry.metadata.apply_to_path(target) {
        warn!("Failed to apply metadata to {}: {}", entry.path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::manifest::test_support::{file_entry, manifest};
    use crate::hash::Hasher;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn stored_queue(contents: &[&str]) -> StorageQueue {
        let backend = Arc::new(MemoryBackend::new());
        let queue = StorageQueue::new(backend, 3);
        for c in contents {
            let data = Bytes::from(c.to_string());
            queue
                .submit(Hasher::default().fingerprint(&data), data)
                .await
                .unwrap();
        }
        queue.drain().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_blocks_are_concatenated_in_manifest_order() -> Result<()> {
        // Stored in a different order than the manifest lists them.
        let queue = stored_queue(&["three", "one", "two"]).await;
        let m = manifest("m", vec![file_entry("dir/file", &["one", "two", "three"])]);

        let dest = TempDir::new()?;
        let report = materialize(&m, &queue, dest.path(), &MaterializeOptions::default()).await?;
        assert_eq!(std::fs::read(dest.path().join("dir/file"))?, b"onetwothree");
        assert_eq!(report.files, 1);
        assert_eq!(report.blocks_fetched, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_filters_select_exact_and_prefix() -> Result<()> {
        let queue = stored_queue(&["a", "b", "c"]).await;
        let m = manifest(
            "m",
            vec![
                file_entry("keep/a", &["a"]),
                file_entry("keepsake", &["b"]),
                file_entry("single", &["c"]),
            ],
        );

        let dest = TempDir::new()?;
        let options = MaterializeOptions {
            filters: vec!["keep/".to_string(), "single".to_string()],
            apply_metadata: false,
        };
        materialize(&m, &queue, dest.path(), &options).await?;
        assert!(dest.path().join("keep/a").exists());
        assert!(dest.path().join("single").exists());
        assert!(!dest.path().join("keepsake").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() -> Result<()> {
        let queue = stored_queue(&["x"]).await;
        let dest = TempDir::new()?;
        for bad in ["../evil", "/etc/evil", "a/../../evil", "\\x2e\\x2e/evil", "bad\\q"] {
            let m = manifest("m", vec![file_entry(bad, &["x"])]);
            let err = materialize(&m, &queue, dest.path(), &MaterializeOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidManifest(_)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_block_stops_materialization() -> Result<()> {
        let queue = stored_queue(&["present"]).await;
        let m = manifest("m", vec![file_entry("f", &["present", "absent"])]);
        let dest = TempDir::new()?;
        let err = materialize(&m, &queue, dest.path(), &MaterializeOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}
