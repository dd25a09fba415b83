//! Backend self-test.
//!
//! Exercises the storage contract against a live backend stack using only
//! names with a reserved prefix, then removes everything it wrote. Useful
//! before pointing a first backup at a new destination.

use crate::backend::{open_backend, Backend, BackendUri};
use crate::config::Config;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Every object the self-test touches starts with this.
pub const SELFTEST_PREFIX: &str = "backup_engine_selftest_";

const LARGE_PAYLOAD: usize = 1024 * 1024;
const BULK_FILES: usize = 20;

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTestReport {
    pub backend: String,
    pub checks: Vec<BackendCheck>,
}

impl BackendTestReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }
}

fn name(suffix: &str) -> String {
    format!("{SELFTEST_PREFIX}{suffix}")
}

async fn prefixed(backend: &dyn Backend) -> Result<Vec<String>> {
    let mut names: Vec<String> = backend
        .list()
        .await?
        .into_iter()
        .filter(|n| n.starts_with(SELFTEST_PREFIX))
        .collect();
    names.sort();
    Ok(names)
}

async fn cleanup(backend: &dyn Backend) -> Result<usize> {
    let names = prefixed(backend).await?;
    for n in &names {
        match backend.delete(n).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(names.len())
}

fn mismatch(what: &str) -> EngineError {
    EngineError::BackendIo(format!("{what} did not match"))
}

async fn put_get_delete(backend: &dyn Backend, suffix: &str, payload: Bytes) -> Result<()> {
    let n = name(suffix);
    backend.put(&n, payload.clone()).await?;
    if backend.get(&n).await? != payload {
        return Err(mismatch("payload read back"));
    }
    if !prefixed(backend).await?.contains(&n) {
        return Err(mismatch("listing after put"));
    }
    backend.delete(&n).await?;
    if prefixed(backend).await?.contains(&n) {
        return Err(mismatch("listing after delete"));
    }
    Ok(())
}

async fn check_basic(backend: &dyn Backend) -> Result<()> {
    put_get_delete(backend, "basic", Bytes::from_static(b"data")).await
}

async fn check_missing(backend: &dyn Backend) -> Result<()> {
    match backend.get(&name("never_written")).await {
        Err(EngineError::NotFound(_)) => {}
        Ok(_) => return Err(mismatch("get of an absent name")),
        Err(e) => return Err(e),
    }
    match backend.delete(&name("never_written")).await {
        Err(EngineError::NotFound(_)) => Ok(()),
        Ok(()) => Err(mismatch("delete of an absent name")),
        Err(e) => Err(e),
    }
}

async fn check_empty(backend: &dyn Backend) -> Result<()> {
    put_get_delete(backend, "empty", Bytes::new()).await
}

async fn check_large(backend: &dyn Backend) -> Result<()> {
    let payload: Vec<u8> = (0..LARGE_PAYLOAD).map(|i| (i % 251) as u8).collect();
    put_get_delete(backend, "large", Bytes::from(payload)).await
}

async fn check_long_name(backend: &dyn Backend) -> Result<()> {
    let suffix = "long_".repeat(40);
    put_get_delete(backend, &suffix, Bytes::from_static(b"long")).await
}

async fn check_bulk(backend: &dyn Backend, concurrency: usize) -> Result<()> {
    let names: Vec<String> = (0..BULK_FILES).map(|i| name(&format!("bulk_{i:04}"))).collect();

    stream::iter(&names)
        .map(|n| async move { backend.put(n, Bytes::from(n.clone())).await })
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;

    if prefixed(backend).await? != names {
        return Err(mismatch("bulk listing"));
    }
    for n in &names {
        if backend.get(n).await? != n.as_bytes() {
            return Err(mismatch("bulk payload"));
        }
    }

    stream::iter(&names)
        .map(|n| backend.delete(n))
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;

    if !prefixed(backend).await?.is_empty() {
        return Err(mismatch("listing after bulk delete"));
    }
    Ok(())
}

fn record(
    checks: &mut Vec<BackendCheck>,
    name: &'static str,
    started: Instant,
    result: Result<()>,
) {
    let duration = started.elapsed();
    match result {
        Ok(()) => {
            info!("Backend check {} passed", name);
            checks.push(BackendCheck {
                name,
                passed: true,
                detail: None,
                duration,
            });
        }
        Err(e) => {
            warn!("Backend check {} failed: {}", name, e);
            checks.push(BackendCheck {
                name,
                passed: false,
                detail: Some(e.to_string()),
                duration,
            });
        }
    }
}

/// Run the self-test against `backend`.
pub async fn run_checks(backend: &dyn Backend, concurrency: usize) -> Result<BackendTestReport> {
    let removed = cleanup(backend).await?;
    if removed > 0 {
        warn!("Removed {} leftover self-test object(s)", removed);
    }

    let mut checks = Vec::new();

    let started = Instant::now();
    let clean = match prefixed(backend).await {
        Ok(names) if names.is_empty() => Ok(()),
        Ok(_) => Err(mismatch("prefix listing before the test")),
        Err(e) => Err(e),
    };
    record(&mut checks, "empty_listing", started, clean);

    let started = Instant::now();
    record(&mut checks, "put_get_delete", started, check_basic(backend).await);
    let started = Instant::now();
    record(&mut checks, "absent_name", started, check_missing(backend).await);
    let started = Instant::now();
    record(&mut checks, "empty_payload", started, check_empty(backend).await);
    let started = Instant::now();
    record(&mut checks, "large_payload", started, check_large(backend).await);
    let started = Instant::now();
    record(&mut checks, "long_name", started, check_long_name(backend).await);
    let started = Instant::now();
    record(
        &mut checks,
        "bulk",
        started,
        check_bulk(backend, concurrency.max(1)).await,
    );

    // Leave nothing behind even when a check failed halfway.
    cleanup(backend).await?;

    Ok(BackendTestReport {
        backend: backend.describe(),
        checks,
    })
}

/// Run the self-test against the full backend stack for `uri`.
pub async fn test_backend(config: &Config, uri: &BackendUri) -> Result<BackendTestReport> {
    let backend = open_backend(uri, config)?;
    info!("Testing backend {}", backend.describe());
    run_checks(backend.as_ref(), config.engine.concurrency).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_backend_passes() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put("unrelated", Bytes::from_static(b"keep")).await?;
        backend.put(&name("leftover"), Bytes::new()).await?;

        let report = run_checks(&backend, 4).await?;
        assert!(report.passed(), "{:?}", report.checks);
        assert_eq!(report.checks.len(), 7);
        assert_eq!(backend.list().await?, vec!["unrelated".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_directory_backend_passes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let uri: BackendUri = format!("dir:{}", temp_dir.path().display()).parse()?;
        let mut config = Config::default();
        config.crypto.key = Some("selftest".to_string());
        config.crypto.compression = true;

        let report = test_backend(&config, &uri).await?;
        assert!(report.passed(), "{:?}", report.checks);
        assert_eq!(report.failures(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_raised() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.fail_puts_of(&name("basic"));

        let report = run_checks(&backend, 2).await?;
        assert!(!report.passed());
        assert_eq!(report.failures(), 1);
        let failed = report.checks.iter().find(|c| !c.passed).unwrap();
        assert_eq!(failed.name, "put_get_delete");
        assert!(failed.detail.is_some());
        Ok(())
    }
}
