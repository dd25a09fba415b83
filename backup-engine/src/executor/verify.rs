//! Verification - compare a live tree against a manifest.
//!
//! Files are re-chunked with the manifest's block size and rehashed with
//! the algorithm its blocks were recorded with, so a clean report means the
//! live tree would persist to exactly the same block lists.

use super::{walk, BlockReader};
use crate::fs::metadata::FileKind;
use crate::hash::{BlockFingerprint, HashAlgorithm, Hasher};
use crate::manifest::Manifest;
use crate::queue::StorageQueue;
use crate::utils::errors::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// One way the live tree (or the data backend) disagrees with the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    /// In the manifest, absent from the tree
    Missing(String),
    /// In the tree, absent from the manifest
    Extra(String),
    KindMismatch {
        path: String,
        expected: FileKind,
        actual: FileKind,
    },
    ContentMismatch(String),
    SymlinkMismatch(String),
    /// Referenced by the manifest, absent from the data backend
    MissingBlock(BlockFingerprint),
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::Missing(p) => write!(f, "missing: {p}"),
            Difference::Extra(p) => write!(f, "extra: {p}"),
            Difference::KindMismatch {
                path,
                expected,
                actual,
            } => write!(f, "kind: {path} (expected {expected:?}, found {actual:?})"),
            Difference::ContentMismatch(p) => write!(f, "content: {p}"),
            Difference::SymlinkMismatch(p) => write!(f, "symlink target: {p}"),
            Difference::MissingBlock(fp) => write!(f, "missing block: {fp}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries_checked: usize,
    pub blocks_checked: usize,
    pub differences: Vec<Difference>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Compare `source` with `manifest`. With `data` given, also check that
/// every referenced block exists on the data backend.
pub async fn verify(
    source: &Path,
    manifest: &Manifest,
    data: Option<&StorageQueue>,
) -> Result<VerifyReport> {
    info!("Verifying {} against {}", source.display(), manifest.label);
    let mut report = VerifyReport::default();

    let live: HashMap<String, _> = walk(source)
        .await?
        .into_iter()
        .map(|e| (e.relative_path.clone(), e))
        .collect();

    let algorithm = manifest
        .fingerprints()
        .next()
        .map(|fp| fp.algorithm())
        .unwrap_or(HashAlgorithm::default());
    let hasher = Hasher::new(algorithm);

    for entry in &manifest.entries {
        report.entries_checked += 1;
        let Some(node) = live.get(&entry.path) else {
            report.differences.push(Difference::Missing(entry.path.clone()));
            continue;
        };

        let expected = entry.metadata.kind();
        let actual = node.metadata.kind();
        if expected != actual {
            report.differences.push(Difference::KindMismatch {
                path: entry.path.clone(),
                expected,
                actual,
            });
            continue;
        }

        match expected {
            FileKind::Regular => {
                let blocks = hash_file(&node.path, manifest.block_size, &hasher).await?;
                if blocks != entry.blocks {
                    report
                        .differences
                        .push(Difference::ContentMismatch(entry.path.clone()));
                }
            }
            FileKind::Symlink => {
                if node.metadata.symlink_target() != entry.metadata.symlink_target() {
                    report
                        .differences
                        .push(Difference::SymlinkMismatch(entry.path.clone()));
                }
            }
            _ => {}
        }
    }

    let recorded: HashSet<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    let mut extra: Vec<&String> = live.keys().filter(|p| !recorded.contains(p.as_str())).collect();
    extra.sort();
    report
        .differences
        .extend(extra.into_iter().map(|p| Difference::Extra(p.clone())));

    if let Some(queue) = data {
        let stored: HashSet<String> = queue.backend().list().await?.into_iter().collect();
        let referenced: BTreeSet<&BlockFingerprint> = manifest.fingerprints().collect();
        report.blocks_checked = referenced.len();
        for fp in referenced {
            if !stored.contains(fp.storage_name()) {
                report.differences.push(Difference::MissingBlock(fp.clone()));
            }
        }
    }

    for difference in &report.differences {
        warn!("Verify: {}", difference);
    }
    info!(
        "Verify complete: {} entries, {} blocks, {} difference(s)",
        report.entries_checked,
        report.blocks_checked,
        report.differences.len()
    );
    Ok(report)
}

async fn hash_file(
    path: &Path,
    block_size: usize,
    hasher: &Hasher,
) -> Result<Vec<BlockFingerprint>> {
    let mut reader = BlockReader::open(path, block_size).await?;
    let mut blocks = Vec::new();
    while let Some(block) = reader.next_block().await? {
        blocks.push(hasher.fingerprint(&block));
    }
    Ok(blocks)
}
