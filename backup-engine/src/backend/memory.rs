//! In-memory backend.
//!
//! Safe for concurrent use of a single instance. Carries call counters and an
//! in-flight high-water mark so tests can observe deduplication and the
//! storage queue's concurrency bound.

use super::Backend;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    put_latency: Option<Duration>,
    fail_names: Mutex<Vec<String>>,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a put finishes, even on error.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` sleep for `latency`, so overlapping uploads are observable.
    pub fn with_put_latency(latency: Duration) -> Self {
        Self {
            put_latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make `put` of the given name fail with a backend I/O error.
    pub fn fail_puts_of(&self, name: &str) {
        if let Ok(mut names) = self.fail_names.lock() {
            names.push(name.to_string());
        }
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Highest number of puts that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Bytes>>> {
        self.objects
            .lock()
            .map_err(|_| EngineError::BackendIo("memory backend lock poisoned".to_string()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.put_latency {
            tokio::time::sleep(latency).await;
        }

        let should_fail = self
            .fail_names
            .lock()
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false);
        if should_fail {
            return Err(EngineError::BackendIo(format!("injected failure for {name}")));
        }

        self.objects()?.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.objects()?
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.objects()?.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_contract() -> Result<()> {
        let backend = MemoryBackend::new();
        assert!(backend.list().await?.is_empty());

        backend.put("x", Bytes::from_static(b"data")).await?;
        assert_eq!(backend.list().await?, vec!["x".to_string()]);
        assert_eq!(backend.get("x").await?, Bytes::from_static(b"data"));

        backend.delete("x").await?;
        assert!(backend.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_names_are_not_found() {
        let backend = MemoryBackend::new();
        assert!(backend.get("absent").await.unwrap_err().is_not_found());
        assert!(backend.delete("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_and_counters() {
        let backend = MemoryBackend::new();
        backend.fail_puts_of("bad");

        assert!(backend.put("good", Bytes::new()).await.is_ok());
        assert!(matches!(
            backend.put("bad", Bytes::new()).await,
            Err(EngineError::BackendIo(_))
        ));
        assert_eq!(backend.put_calls(), 2);
        assert_eq!(backend.max_in_flight(), 1);
        assert_eq!(backend.len(), 1);
    }
}
