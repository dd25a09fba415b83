//! Human-readable output for command results.
//!
//! Commands return typed reports; the CLI renders them with the functions
//! here so that formatting stays testable without capturing stdout.

use crate::commands::{BackendTestReport, GcReport};
use crate::executor::{MaterializeReport, PersistReport, VerifyReport};
use crate::manifest::{CommonBlocks, Manifest, ManifestSummary, ManifestTotals};
use std::fmt::Write;
use std::time::Duration;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let per_second = if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        bytes
    };
    format!("{}/s", format_bytes(per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// `1234567` -> `1'234'567`
pub fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('\'');
        }
        out.push(c);
    }
    out
}

fn megabytes(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / (1024.0 * 1024.0))
}

pub fn persist_summary(report: &PersistReport) -> String {
    format!(
        "Persisted {}: {} entries, {} files, {} in {} ({})\nBlocks up/skip: {}/{} ({} known before the run)",
        report.label,
        report.entries,
        report.files,
        format_bytes(report.bytes),
        format_duration(report.duration.as_secs()),
        format_speed(report.bytes, report.duration),
        report.blocks_uploaded,
        report.blocks_skipped,
        report.known_blocks
    )
}

pub fn materialize_summary(report: &MaterializeReport) -> String {
    let mut out = format!(
        "Materialized {} files, {} directories, {} symlinks: {} from {} blocks in {}",
        report.files,
        report.directories,
        report.symlinks,
        format_bytes(report.bytes),
        report.blocks_fetched,
        format_duration(report.duration.as_secs())
    );
    if report.skipped > 0 {
        let _ = write!(out, "\nSkipped {} special node(s)", report.skipped);
    }
    out
}

pub fn verify_summary(report: &VerifyReport) -> String {
    let mut out = String::new();
    for difference in &report.differences {
        let _ = writeln!(out, "{difference}");
    }
    if report.is_clean() {
        let _ = write!(
            out,
            "OK: {} entries and {} blocks verified",
            report.entries_checked, report.blocks_checked
        );
    } else {
        let _ = write!(
            out,
            "FAILED: {} difference(s) across {} entries",
            report.differences.len(),
            report.entries_checked
        );
    }
    out
}

pub fn gc_summary(report: &GcReport) -> String {
    let mut out = String::new();
    if report.dry_run {
        for name in &report.orphans {
            let _ = writeln!(out, "{name}");
        }
        let _ = write!(out, "{} orphan block(s) would be deleted", report.orphans.len());
    } else {
        let _ = write!(out, "Deleted {} orphan block(s)", report.deleted);
    }
    out
}

/// The `list-manifests` table with a totals row.
pub fn manifest_table(summaries: &[ManifestSummary], totals: &ManifestTotals) -> String {
    let width = summaries
        .iter()
        .map(|s| s.label.len())
        .chain(["Manifest".len(), "Total".len()])
        .max()
        .unwrap_or(8);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$} {:>10} {:>10} {:>10} {:>12}",
        "Manifest", "Files", "Blocks", "Shared", "MB"
    );
    for s in summaries {
        let _ = writeln!(
            out,
            "{:<width$} {:>10} {:>10} {:>10} {:>12}",
            s.label,
            s.files,
            s.blocks,
            s.shared,
            megabytes(s.bytes)
        );
    }
    let _ = write!(
        out,
        "{:<width$} {:>10} {:>10} {:>10} {:>12}",
        "Total",
        totals.files,
        totals.unique_blocks,
        totals.deduplicated,
        megabytes(totals.bytes)
    );
    out
}

/// The `show-manifest` table: one row per entry and a totals row.
pub fn show_manifest_table(manifest: &Manifest) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {} from {}:{} at {} (block size {})",
        manifest.label,
        manifest.hostname,
        manifest.source,
        manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        group_digits(manifest.block_size as u64)
    );
    let _ = writeln!(out, "{:<10} {:>8} {:>15} Name", "Attr", "Blocks", "Bytes");
    for entry in &manifest.entries {
        let mut name = entry.path.clone();
        if let Some(target) = entry.metadata.symlink_target() {
            let _ = write!(name, " -> {target}");
        }
        let _ = writeln!(
            out,
            "{:<10} {:>8} {:>15} {}",
            entry.metadata.mode_string(),
            group_digits(entry.blocks.len() as u64),
            group_digits(entry.metadata.size().unwrap_or(0)),
            name
        );
    }
    let _ = write!(
        out,
        "{:<10} {:>8} {:>15} {} entries",
        "Total",
        group_digits(manifest.block_count() as u64),
        group_digits(manifest.total_bytes()),
        manifest.entries.len()
    );
    out
}

pub fn common_blocks_summary(common: &CommonBlocks) -> String {
    let mut out = String::new();
    for (label, unique) in &common.unique_per_manifest {
        let _ = writeln!(out, "{unique} unique in {label}");
    }
    let _ = write!(out, "{} in common", common.common.len());
    out
}

pub fn backend_test_summary(report: &BackendTestReport) -> String {
    let mut out = format!("Testing {}\n", report.backend);
    for check in &report.checks {
        let status = if check.passed { "ok" } else { "FAILED" };
        let _ = write!(
            out,
            "{:<16} {:<7} {:>6} ms",
            check.name,
            status,
            check.duration.as_millis()
        );
        if let Some(detail) = &check.detail {
            let _ = write!(out, "  {detail}");
        }
        out.push('\n');
    }
    if report.passed() {
        out.push_str("All checks passed");
    } else {
        let _ = write!(out, "{} check(s) failed", report.failures());
    }
    out
}
