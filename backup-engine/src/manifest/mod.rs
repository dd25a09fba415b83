//! Manifests - the durable ledger of one backup run.
//!
//! A manifest maps every traversed path to its metadata and the ordered
//! list of block fingerprints that reconstruct it. It is stored as one JSON
//! object named after its label on the manifest backend, and is never
//! rewritten: a new run always gets a new label.

pub mod blocks;
pub mod skip_blocks;

use crate::backend::Backend;
use crate::fs::metadata::FileMetaData;
use crate::hash::BlockFingerprint;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use blocks::{
    all_block_fingerprints, common_blocks, orphan_blocks, shared_blocks, summarize,
    unique_blocks, CommonBlocks, ManifestSummary, ManifestTotals,
};
pub use skip_blocks::{read_skip_blocks, write_skip_blocks};

pub const MANIFEST_VERSION: u32 = 1;

/// One file, directory, symlink or special node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the backup root, `/`-separated
    pub path: String,
    pub metadata: FileMetaData,
    /// Concatenated in order these reproduce the file; empty for non-files
    #[serde(default)]
    pub blocks: Vec<BlockFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    /// Source directory the run was taken from
    pub source: String,
    pub block_size: usize,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(
        label: &str,
        source: &str,
        block_size: usize,
        entries: Vec<ManifestEntry>,
    ) -> Result<Self> {
        validate_label(label)?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            version: MANIFEST_VERSION,
            label: label.to_string(),
            created_at: Utc::now(),
            hostname,
            source: source.to_string(),
            block_size,
            entries,
        })
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Every block reference in entry order, repeats included.
    pub fn fingerprints(&self) -> impl Iterator<Item = &BlockFingerprint> {
        self.entries.iter().flat_map(|e| e.blocks.iter())
    }

    pub fn block_count(&self) -> usize {
        self.entries.iter().map(|e| e.blocks.len()).sum()
    }

    /// Sum of regular file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.metadata.size()).sum()
    }
}

/// Labels become object names and appear in `a,label,b` descriptors.
pub fn validate_label(label: &str) -> Result<()> {
    let invalid = label.is_empty()
        || label == "."
        || label == ".."
        || label.starts_with('.')
        || label.contains(['/', '\\', ',', '\0'])
        || label.chars().any(char::is_control);
    if invalid {
        return Err(EngineError::InvalidDescriptor(format!(
            "invalid manifest label '{label}'"
        )));
    }
    Ok(())
}

/// Store `manifest` under its label. Fails with `DuplicateLabel` if the
/// label already exists; manifests are never overwritten.
pub async fn write_manifest(backend: &dyn Backend, manifest: &Manifest) -> Result<()> {
    validate_label(&manifest.label)?;
    ensure_label_free(backend, &manifest.label).await?;

    let json = serde_json::to_vec_pretty(manifest)?;
    debug!(
        "Writing manifest {} ({} entries, {} bytes)",
        manifest.label,
        manifest.entries.len(),
        json.len()
    );
    backend.put(&manifest.label, Bytes::from(json)).await?;
    info!("Wrote manifest {} to {}", manifest.label, backend.describe());
    Ok(())
}

/// Fail with `DuplicateLabel` if `label` is already taken.
pub async fn ensure_label_free(backend: &dyn Backend, label: &str) -> Result<()> {
    if list_manifests(backend).await?.iter().any(|l| l == label) {
        return Err(EngineError::DuplicateLabel(label.to_string()));
    }
    Ok(())
}

pub async fn read_manifest(backend: &dyn Backend, label: &str) -> Result<Manifest> {
    validate_label(label)?;
    let data = backend.get(label).await.map_err(|e| match e {
        EngineError::NotFound(_) => EngineError::NotFound(format!("manifest {label}")),
        other => other,
    })?;

    let manifest: Manifest = serde_json::from_slice(&data)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(EngineError::InvalidManifest(format!(
            "{label}: unsupported version {}",
            manifest.version
        )));
    }
    if manifest.label != label {
        return Err(EngineError::InvalidManifest(format!(
            "{label}: stored under a different label ({})",
            manifest.label
        )));
    }
    Ok(manifest)
}

/// Labels on the manifest backend, sorted.
pub async fn list_manifests(backend: &dyn Backend) -> Result<Vec<String>> {
    let mut labels = backend.list().await?;
    labels.sort();
    Ok(labels)
}

/// Read every manifest, in label order.
pub async fn read_all_manifests(backend: &dyn Backend) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for label in list_manifests(backend).await? {
        manifests.push(read_manifest(backend, &label).await?);
    }
    Ok(manifests)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::fs::metadata::FileKind;
    use crate::hash::Hasher;

    pub fn file_entry(path: &str, contents: &[&str]) -> ManifestEntry {
        let hasher = Hasher::default();
        let size: usize = contents.iter().map(|c| c.len()).sum();
        ManifestEntry {
            path: path.to_string(),
            metadata: FileMetaData::builder()
                .kind(FileKind::Regular)
                .owner(0, 0)
                .size(Some(size as u64))
                .times(0, 0, 0)
                .permissions(0o644)
                .special_bits(false, false, false)
                .symlink_target(None)
                .build()
                .unwrap(),
            blocks: contents.iter().map(|c| hasher.fingerprint(c.as_bytes())).collect(),
        }
    }

    pub fn manifest(label: &str, entries: Vec<ManifestEntry>) -> Manifest {
        Manifest::new(label, "/src", 1024, entries).unwrap()
    }
}
