//! Block-set arithmetic over manifests.
//!
//! Read-only helpers behind the listing commands and garbage collection.

use super::Manifest;
use crate::hash::BlockFingerprint;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Every block reference across `manifests`, repeats included.
pub fn all_block_fingerprints(manifests: &[Manifest]) -> Vec<BlockFingerprint> {
    manifests
        .iter()
        .flat_map(|m| m.fingerprints().cloned())
        .collect()
}

pub fn unique_blocks(manifests: &[Manifest]) -> BTreeSet<BlockFingerprint> {
    manifests
        .iter()
        .flat_map(|m| m.fingerprints().cloned())
        .collect()
}

/// Blocks referenced more than once across all `manifests`, whether within
/// one manifest or between several.
pub fn shared_blocks(manifests: &[Manifest]) -> BTreeSet<BlockFingerprint> {
    let mut counts: HashMap<&BlockFingerprint, usize> = HashMap::new();
    for fp in manifests.iter().flat_map(|m| m.fingerprints()) {
        *counts.entry(fp).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(fp, _)| fp.clone())
        .collect()
}

/// Result of [`common_blocks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonBlocks {
    /// Blocks present in every manifest
    pub common: BTreeSet<BlockFingerprint>,
    /// `(label, distinct blocks not shared by all)` per manifest, in input order
    pub unique_per_manifest: Vec<(String, usize)>,
}

pub fn common_blocks(manifests: &[Manifest]) -> CommonBlocks {
    let sets: Vec<BTreeSet<&BlockFingerprint>> = manifests
        .iter()
        .map(|m| m.fingerprints().collect())
        .collect();

    let common: BTreeSet<BlockFingerprint> = match sets.split_first() {
        Some((first, rest)) => first
            .iter()
            .filter(|fp| rest.iter().all(|s| s.contains(*fp)))
            .map(|fp| (*fp).clone())
            .collect(),
        None => BTreeSet::new(),
    };

    let unique_per_manifest = manifests
        .iter()
        .zip(&sets)
        .map(|(m, set)| (m.label.clone(), set.len() - common.len()))
        .collect();

    CommonBlocks {
        common,
        unique_per_manifest,
    }
}

/// Names on the data backend that no manifest references, sorted.
pub fn orphan_blocks(data_names: &[String], manifests: &[Manifest]) -> Vec<String> {
    let referenced: HashSet<&str> = manifests
        .iter()
        .flat_map(|m| m.fingerprints())
        .map(|fp| fp.storage_name())
        .collect();

    let mut orphans: Vec<String> = data_names
        .iter()
        .filter(|name| !referenced.contains(name.as_str()))
        .cloned()
        .collect();
    orphans.sort();
    orphans
}

/// Per-manifest figures for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSummary {
    pub label: String,
    pub files: usize,
    pub blocks: usize,
    /// References in this manifest to blocks used more than once overall
    pub shared: usize,
    pub bytes: u64,
}

/// Totals across all summarized manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestTotals {
    pub files: usize,
    /// Distinct blocks actually stored
    pub unique_blocks: usize,
    /// References saved by deduplication
    pub deduplicated: usize,
    pub bytes: u64,
}

pub fn summarize(manifests: &[Manifest]) -> (Vec<ManifestSummary>, ManifestTotals) {
    let shared = shared_blocks(manifests);

    let summaries: Vec<ManifestSummary> = manifests
        .iter()
        .map(|m| ManifestSummary {
            label: m.label.clone(),
            files: m.entries.len(),
            blocks: m.block_count(),
            shared: m.fingerprints().filter(|fp| shared.contains(*fp)).count(),
            bytes: m.total_bytes(),
        })
        .collect();

    let total_refs: usize = summaries.iter().map(|s| s.blocks).sum();
    let unique = unique_blocks(manifests).len();
    let totals = ManifestTotals {
        files: summaries.iter().map(|s| s.files).sum(),
        unique_blocks: unique,
        deduplicated: total_refs - unique,
        bytes: summaries.iter().map(|s| s.bytes).sum(),
    };
    (summaries, totals)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{file_entry, manifest};
    use super::*;
    use crate::hash::Hasher;

    fn fixtures() -> Vec<Manifest> {
        vec![
            manifest(
                "mon",
                vec![file_entry("a", &["A", "B"]), file_entry("b", &["C", "A"])],
            ),
            manifest("tue", vec![file_entry("a", &["A", "D"])]),
        ]
    }

    fn fp(content: &str) -> BlockFingerprint {
        Hasher::default().fingerprint(content.as_bytes())
    }

    #[test]
    fn test_flatten_and_unique() {
        let manifests = fixtures();
        assert_eq!(all_block_fingerprints(&manifests).len(), 6);
        assert_eq!(unique_blocks(&manifests).len(), 4);
    }

    #[test]
    fn test_shared_counts_repeats_within_and_across() {
        let shared = shared_blocks(&fixtures());
        assert_eq!(shared, BTreeSet::from([fp("A")]));
    }

    #[test]
    fn test_common_blocks() {
        let result = common_blocks(&fixtures());
        assert_eq!(result.common, BTreeSet::from([fp("A")]));
        assert_eq!(
            result.unique_per_manifest,
            vec![("mon".to_string(), 2), ("tue".to_string(), 1)]
        );
        assert!(common_blocks(&[]).common.is_empty());
    }

    #[test]
    fn test_orphans_are_unreferenced_data_names() {
        let names = vec![
            fp("D").storage_name().to_string(),
            fp("Z").storage_name().to_string(),
            fp("A").storage_name().to_string(),
        ];
        assert_eq!(
            orphan_blocks(&names, &fixtures()),
            vec![fp("Z").storage_name().to_string()]
        );
        assert_eq!(orphan_blocks(&names, &[]).len(), 3);
    }

    #[test]
    fn test_summarize() {
        let (summaries, totals) = summarize(&fixtures());
        assert_eq!(summaries[0].files, 2);
        assert_eq!(summaries[0].blocks, 4);
        assert_eq!(summaries[0].shared, 2);
        assert_eq!(summaries[1].shared, 1);
        assert_eq!(totals.files, 3);
        assert_eq!(totals.unique_blocks, 4);
        assert_eq!(totals.deduplicated, 2);
        assert_eq!(totals.bytes, 6);
    }
}
