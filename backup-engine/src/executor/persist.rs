//! Persistence engine - turn a live directory tree into a new manifest.

use super::{walk, BlockReader};
use crate::backend::Backend;
use crate::config::PersistOptions;
use crate::hash::{BlockFingerprint, Hasher};
use crate::manifest::{
    ensure_label_free, read_all_manifests, read_skip_blocks, validate_label, write_manifest,
    Manifest, ManifestEntry,
};
use crate::queue::{StorageQueue, Submission};
use crate::utils::errors::Result;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Persist execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub label: String,
    /// Manifest entries of any kind
    pub entries: usize,
    /// Regular files read
    pub files: usize,
    pub bytes: u64,
    pub blocks_uploaded: usize,
    /// Blocks already stored (skip-set or earlier in this run)
    pub blocks_skipped: usize,
    /// Size of the skip-set the run started with
    pub known_blocks: usize,
    pub duration: Duration,
}

/// Seed the queue's skip-set as selected by `options`. Returns how many
/// fingerprints were added.
pub async fn seed_skip_set(
    queue: &StorageQueue,
    manifest_backend: &dyn Backend,
    options: &PersistOptions,
) -> Result<usize> {
    let mut added = 0;

    if let Some(path) = &options.skip_blocks_file {
        info!("Loading skip-blocks file {}", path.display());
        added += queue.mark_known(read_skip_blocks(path)?)?;
    }

    if options.scan_manifests {
        info!("Checking old manifests...");
        let manifests = read_all_manifests(manifest_backend).await?;
        let fingerprints = manifests.iter().flat_map(|m| m.fingerprints().cloned());
        added += queue.mark_known(fingerprints)?;
    }

    if options.continue_from_backend {
        info!("Checking for previously uploaded blocks...");
        let names = queue.backend().list().await?;
        let fingerprints = names.iter().filter_map(|name| {
            let fp = BlockFingerprint::from_digest(name).ok();
            if fp.is_none() {
                debug!("Ignoring non-block object {}", name);
            }
            fp
        });
        added += queue.mark_known(fingerprints)?;
    }

    Ok(added)
}

/// Persist `source` under `label`.
///
/// Refuses an existing label before reading anything. The manifest is
/// written only after every queued upload has been confirmed; if any
/// upload fails no manifest is written and the aggregate error is returned.
pub async fn persist(
    source: &Path,
    manifest_backend: &dyn Backend,
    label: &str,
    queue: &StorageQueue,
    options: &PersistOptions,
) -> Result<PersistReport> {
    let start_time = Instant::now();
    validate_label(label)?;
    ensure_label_free(manifest_backend, label).await?;

    let known_blocks = seed_skip_set(queue, manifest_backend, options).await?;
    info!(
        "Starting persist of {} as {} ({} known blocks)",
        source.display(),
        label,
        known_blocks
    );

    let hasher = Hasher::new(options.hash_algorithm);
    let nodes = walk(source).await?;

    let mut entries = Vec::with_capacity(nodes.len());
    let mut files = 0;
    let mut bytes = 0u64;
    let mut blocks_uploaded = 0;
    let mut blocks_skipped = 0;

    for node in nodes {
        let mut blocks = Vec::new();

        if node.metadata.is_regular() {
            let (up, skip) = persist_file(
                &node.path,
                options.block_size,
                &hasher,
                queue,
                &mut blocks,
                &mut bytes,
            )
            .await?;
            info!(
                "[{}] scheduled. Blocks up/skip: {}/{}",
                node.relative_path, up, skip
            );
            blocks_uploaded += up;
            blocks_skipped += skip;
            files += 1;
        }

        entries.push(ManifestEntry {
            path: node.relative_path,
            metadata: node.metadata,
            blocks,
        });
    }

    queue.drain().await?;

    let manifest = Manifest::new(
        label,
        &source.display().to_string(),
        options.block_size,
        entries,
    )?;
    write_manifest(manifest_backend, &manifest).await?;

    let report = PersistReport {
        label: label.to_string(),
        entries: manifest.entries.len(),
        files,
        bytes,
        blocks_uploaded,
        blocks_skipped,
        known_blocks,
        duration: start_time.elapsed(),
    };
    info!(
        "Persist complete: {} files, {} bytes, blocks up/skip {}/{}",
        report.files, report.bytes, report.blocks_uploaded, report.blocks_skipped
    );
    Ok(report)
}

/// Chunk, hash and submit one file, recording its fingerprints in order.
async fn persist_file(
    path: &Path,
    block_size: usize,
    hasher: &Hasher,
    queue: &StorageQueue,
    blocks: &mut Vec<BlockFingerprint>,
    bytes: &mut u64,
) -> Result<(usize, usize)> {
    let mut reader = BlockReader::open(path, block_size).await?;
    let (mut up, mut skip) = (0, 0);

    while let Some(block) = reader.next_block().await? {
        *bytes += block.len() as u64;
        let fp = hasher.fingerprint(&block);
        match queue.submit(fp.clone(), block).await? {
            Submission::Queued => up += 1,
            Submission::Deduplicated => skip += 1,
        }
        blocks.push(fp);
    }
    Ok((up, skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::Config;
    use crate::hash::HashAlgorithm;
    use crate::manifest::{read_manifest, write_skip_blocks};
    use crate::utils::errors::EngineError;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn options(block_size: usize) -> PersistOptions {
        let mut config = Config::default();
        config.engine.block_size = block_size;
        PersistOptions::from_config(&config).unwrap()
    }

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaaabbbbcc").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"aaaa").unwrap();
        fs::write(dir.path().join("sub/empty"), b"").unwrap();
        std::os::unix::fs::symlink("a.txt", dir.path().join("link")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_persist_records_blocks_in_order() -> Result<()> {
        let src = source_tree();
        let manifests = MemoryBackend::new();
        let data = Arc::new(MemoryBackend::new());
        let queue = StorageQueue::new(data.clone(), 4);

        let report = persist(src.path(), &manifests, "first", &queue, &options(4)).await?;
        assert_eq!(report.files, 3);
        assert_eq!(report.entries, 5);
        assert_eq!(report.bytes, 14);
        // "aaaa" appears twice; uploaded once.
        assert_eq!(report.blocks_uploaded, 3);
        assert_eq!(report.blocks_skipped, 1);
        assert_eq!(data.put_calls(), 3);

        let manifest = read_manifest(&manifests, "first").await?;
        let paths: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "link", "sub", "sub/b.txt", "sub/empty"]);

        let hasher = Hasher::new(HashAlgorithm::Sha512);
        let a = manifest.entry("a.txt").unwrap();
        assert_eq!(
            a.blocks,
            vec![
                hasher.fingerprint(b"aaaa"),
                hasher.fingerprint(b"bbbb"),
                hasher.fingerprint(b"cc")
            ]
        );
        assert!(manifest.entry("sub").unwrap().blocks.is_empty());
        assert!(manifest.entry("link").unwrap().blocks.is_empty());
        assert!(manifest.entry("sub/empty").unwrap().blocks.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_uploads_nothing_new() -> Result<()> {
        let src = source_tree();
        let manifests = MemoryBackend::new();
        let data = Arc::new(MemoryBackend::new());

        persist(src.path(), &manifests, "one", &StorageQueue::new(data.clone(), 2), &options(4))
            .await?;
        let calls = data.put_calls();

        let report =
            persist(src.path(), &manifests, "two", &StorageQueue::new(data.clone(), 2), &options(4))
                .await?;
        assert_eq!(data.put_calls(), calls);
        assert_eq!(report.blocks_uploaded, 0);
        assert_eq!(report.known_blocks, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_blocks_file_and_continue() -> Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("only"), b"xyz")?;
        let fp = Hasher::default().fingerprint(b"xyz");

        let skip_dir = TempDir::new()?;
        let skip_file = skip_dir.path().join("skip");
        write_skip_blocks(&skip_file, [&fp])?;

        let manifests = MemoryBackend::new();
        let data = Arc::new(MemoryBackend::new());
        let mut opts = options(1024);
        opts.skip_blocks_file = Some(skip_file);
        opts.scan_manifests = false;

        persist(src.path(), &manifests, "skip", &StorageQueue::new(data.clone(), 2), &opts).await?;
        assert_eq!(data.put_calls(), 0);
        let manifest = read_manifest(&manifests, "skip").await?;
        assert_eq!(manifest.entry("only").unwrap().blocks, vec![fp.clone()]);

        // A data backend listing seeds the set too.
        let data = Arc::new(MemoryBackend::new());
        data.put(fp.storage_name(), bytes::Bytes::from_static(b"xyz")).await?;
        data.put("not-a-block", bytes::Bytes::new()).await?;
        let mut opts = options(1024);
        opts.scan_manifests = false;
        opts.continue_from_backend = true;
        let calls = data.put_calls();
        persist(src.path(), &manifests, "cont", &StorageQueue::new(data.clone(), 2), &opts).await?;
        assert_eq!(data.put_calls(), calls);
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_label_is_refused_first() -> Result<()> {
        let src = source_tree();
        let manifests = MemoryBackend::new();
        let data = Arc::new(MemoryBackend::new());
        persist(src.path(), &manifests, "snap", &StorageQueue::new(data.clone(), 2), &options(4))
            .await?;

        let fresh = Arc::new(MemoryBackend::new());
        let queue = StorageQueue::new(fresh.clone(), 2);
        let err = persist(src.path(), &manifests, "snap", &queue, &options(4))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLabel(_)));
        assert_eq!(fresh.put_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_upload_writes_no_manifest() -> Result<()> {
        let src = source_tree();
        let manifests = MemoryBackend::new();
        let data = Arc::new(MemoryBackend::new());
        data.fail_puts_of(Hasher::default().fingerprint(b"bbbb").storage_name());

        let queue = StorageQueue::new(data.clone(), 2);
        let err = persist(src.path(), &manifests, "broken", &queue, &options(4))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AggregateUpload { ref failed } if failed.len() == 1));
        assert!(manifests.list().await?.is_empty());
        Ok(())
    }
}
