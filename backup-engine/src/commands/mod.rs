//! Command implementations.
//!
//! One async function per CLI command. Each opens the backends it needs from
//! the typed configuration, calls into the engine and returns a typed
//! result; formatting for humans lives in [`crate::report`].

mod selftest;

pub use selftest::{test_backend, BackendCheck, BackendTestReport, SELFTEST_PREFIX};

use crate::backend::{open_backend, Backend, BackendPair, BackendUri, Destination};
use crate::config::{Config, MaterializeOptions, PersistOptions};
use crate::executor::{self, MaterializeReport, PersistReport, VerifyReport};
use crate::hash::BlockFingerprint;
use crate::manifest::{self, CommonBlocks, Manifest, ManifestSummary, ManifestTotals};
use crate::queue::StorageQueue;
use crate::utils::errors::{EngineError, Result};
use futures_util::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

fn open_shared(uri: &BackendUri, config: &Config) -> Result<Arc<dyn Backend>> {
    Ok(Arc::from(open_backend(uri, config)?))
}

fn storage_queue(uri: &BackendUri, config: &Config) -> Result<StorageQueue> {
    Ok(StorageQueue::new(
        open_shared(uri, config)?,
        config.engine.concurrency,
    ))
}

/// Back up `source` to `destination`.
pub async fn persist(
    config: &Config,
    source: &Path,
    destination: &Destination,
    options: &PersistOptions,
) -> Result<PersistReport> {
    let manifests = open_backend(&destination.manifest, config)?;
    let queue = storage_queue(&destination.data, config)?;
    executor::persist(source, manifests.as_ref(), &destination.label, &queue, options).await
}

/// Restore the manifest named by `source` into `destination`.
pub async fn materialize(
    config: &Config,
    source: &Destination,
    destination: &Path,
    options: &MaterializeOptions,
) -> Result<MaterializeReport> {
    let manifests = open_backend(&source.manifest, config)?;
    let manifest = manifest::read_manifest(manifests.as_ref(), &source.label).await?;
    let queue = storage_queue(&source.data, config)?;
    executor::materialize(&manifest, &queue, destination, options).await
}

/// Compare a live tree with a stored manifest; with `check_blocks`, also
/// confirm every referenced block exists on the data backend.
pub async fn verify(
    config: &Config,
    source: &Path,
    descriptor: &Destination,
    check_blocks: bool,
) -> Result<VerifyReport> {
    let manifests = open_backend(&descriptor.manifest, config)?;
    let manifest = manifest::read_manifest(manifests.as_ref(), &descriptor.label).await?;
    let queue = if check_blocks {
        Some(storage_queue(&descriptor.data, config)?)
    } else {
        None
    };
    executor::verify(source, &manifest, queue.as_ref()).await
}

/// Result of [`garbage_collect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub orphans: Vec<String>,
    pub deleted: usize,
    pub dry_run: bool,
}

/// Delete data blocks no manifest references.
///
/// Refuses to run against a manifest backend with no manifests at all,
/// which would otherwise make every block an orphan.
pub async fn garbage_collect(
    config: &Config,
    backends: &BackendPair,
    dry_run: bool,
) -> Result<GcReport> {
    let manifests = open_backend(&backends.manifest, config)?;
    let all = manifest::read_all_manifests(manifests.as_ref()).await?;
    if all.is_empty() {
        return Err(EngineError::Config(format!(
            "no manifests on {}; refusing to treat every block as garbage",
            backends.manifest
        )));
    }

    let data = open_shared(&backends.data, config)?;
    let orphans = manifest::orphan_blocks(&data.list().await?, &all);
    info!(
        "Found {} orphan block(s) across {} manifest(s)",
        orphans.len(),
        all.len()
    );

    if dry_run {
        return Ok(GcReport {
            orphans,
            deleted: 0,
            dry_run,
        });
    }

    let results: Vec<Result<()>> = stream::iter(&orphans)
        .map(|name| {
            let data = Arc::clone(&data);
            async move {
                match data.delete(name).await {
                    // Someone else collected it first.
                    Err(EngineError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        })
        .buffer_unordered(config.engine.concurrency.max(1))
        .collect()
        .await;

    let mut deleted = 0;
    let mut failures = 0;
    for result in results {
        match result {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Failed to delete orphan block: {}", e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(EngineError::BackendIo(format!(
            "{failures} orphan block(s) could not be deleted"
        )));
    }

    info!("Deleted {} orphan block(s)", deleted);
    Ok(GcReport {
        orphans,
        deleted,
        dry_run,
    })
}

/// Summaries of every manifest on a backend, sorted by label.
pub async fn list_manifests(
    config: &Config,
    uri: &BackendUri,
) -> Result<(Vec<ManifestSummary>, ManifestTotals)> {
    let backend = open_backend(uri, config)?;
    let all = manifest::read_all_manifests(backend.as_ref()).await?;
    Ok(manifest::summarize(&all))
}

/// Every name on a backend, sorted.
pub async fn list_files(config: &Config, uri: &BackendUri) -> Result<Vec<String>> {
    let backend = open_backend(uri, config)?;
    let mut names = backend.list().await?;
    names.sort();
    Ok(names)
}

/// Blocks stored on a data backend; names that are not block digests are
/// left out.
pub async fn list_blocks(config: &Config, uri: &BackendUri) -> Result<Vec<BlockFingerprint>> {
    let backend = open_backend(uri, config)?;
    let mut blocks: Vec<BlockFingerprint> = backend
        .list()
        .await?
        .iter()
        .filter_map(|name| BlockFingerprint::from_digest(name).ok())
        .collect();
    blocks.sort();
    Ok(blocks)
}

/// Data blocks referenced by no manifest.
pub async fn list_orphans(config: &Config, backends: &BackendPair) -> Result<Vec<String>> {
    let manifests = open_backend(&backends.manifest, config)?;
    let all = manifest::read_all_manifests(manifests.as_ref()).await?;
    let data = open_backend(&backends.data, config)?;
    Ok(manifest::orphan_blocks(&data.list().await?, &all))
}

/// Blocks shared by all of the named manifests.
pub async fn common_blocks(
    config: &Config,
    uri: &BackendUri,
    labels: &[String],
) -> Result<CommonBlocks> {
    if labels.is_empty() {
        return Err(EngineError::Config(
            "common-blocks needs at least one manifest label".to_string(),
        ));
    }
    let backend = open_backend(uri, config)?;
    let mut manifests = Vec::with_capacity(labels.len());
    for label in labels {
        manifests.push(manifest::read_manifest(backend.as_ref(), label).await?);
    }
    Ok(manifest::common_blocks(&manifests))
}

/// Copy one object to a local file. `name` may be a block fingerprint
/// (`sha512:…` or a bare digest) or any raw object name. Returns the local
/// path and the number of bytes written.
pub async fn get_block(
    config: &Config,
    uri: &BackendUri,
    name: &str,
    local: Option<&Path>,
) -> Result<(PathBuf, u64)> {
    let object = match name.parse::<BlockFingerprint>() {
        Ok(fp) => fp.storage_name().to_string(),
        Err(_) => name.to_string(),
    };
    let local = local
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&object));

    let backend = open_backend(uri, config)?;
    let data = backend.get(&object).await?;
    tokio::fs::write(&local, &data).await?;
    Ok((local, data.len() as u64))
}

pub async fn show_manifest(config: &Config, uri: &BackendUri, label: &str) -> Result<Manifest> {
    let backend = open_backend(uri, config)?;
    manifest::read_manifest(backend.as_ref(), label).await
}
