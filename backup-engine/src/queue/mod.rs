//! Storage queue - bounded, deduplicating block upload scheduler.
//!
//! Every unique fingerprint is uploaded at most once per queue. A
//! fingerprint that is pending, in flight, stored, or seeded as known from an
//! earlier run is never submitted again.
//!
//! Backpressure: `submit` waits for a free upload slot before spawning the
//! upload, so at most `concurrency` uploads (and their payloads) are alive
//! at any time. `drain` is fail-slow: it waits for every upload and then
//! reports all failures at once.

use crate::backend::Backend;
use crate::hash::{BlockFingerprint, Hasher};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Upload state of one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Accepted, waiting for an upload slot
    Pending,
    InFlight,
    /// Stored, either by this queue or known from before
    Done,
    Failed,
}

/// Outcome of [`StorageQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Already known, pending or in flight; nothing was uploaded
    Deduplicated,
}

/// Result of one [`StorageQueue::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub uploaded: usize,
    pub deduplicated: usize,
}

/// Cumulative counters over the lifetime of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub known: usize,
    pub in_flight: usize,
    pub uploaded: usize,
    pub deduplicated: usize,
    pub failed: usize,
}

type StatusMap = HashMap<BlockFingerprint, BlockStatus>;

pub struct StorageQueue {
    backend: Arc<dyn Backend>,
    concurrency: usize,
    slots: Arc<Semaphore>,
    status: Arc<Mutex<StatusMap>>,
    tasks: Mutex<JoinSet<(BlockFingerprint, Result<()>)>>,
    uploaded: AtomicUsize,
    deduplicated: AtomicUsize,
    deduplicated_since_drain: AtomicUsize,
}

fn lock(status: &Mutex<StatusMap>) -> Result<MutexGuard<'_, StatusMap>> {
    status
        .lock()
        .map_err(|_| EngineError::BackendIo("storage queue state poisoned".to_string()))
}

struct PendingGuard<'a> {
    status: &'a Mutex<StatusMap>,
    fp: Option<BlockFingerprint>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(fp) = self.fp.take() {
            if let Ok(mut map) = self.status.lock() {
                map.insert(fp, BlockStatus::Failed);
            }
        }
    }
}

impl StorageQueue {
    /// Create a queue uploading to `backend` with at most `concurrency`
    /// uploads in flight. A concurrency of 0 is treated as 1.
    pub fn new(backend: Arc<dyn Backend>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            backend,
            concurrency,
            slots: Arc::new(Semaphore::new(concurrency)),
            status: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(JoinSet::new()),
            uploaded: AtomicUsize::new(0),
            deduplicated: AtomicUsize::new(0),
            deduplicated_since_drain: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Seed the skip-set with fingerprints already stored on the backend.
    pub fn mark_known<I>(&self, fingerprints: I) -> Result<usize>
    where
        I: IntoIterator<Item = BlockFingerprint>,
    {
        let mut status = lock(&self.status)?;
        let mut added = 0;
        for fp in fingerprints {
            match status.get(&fp) {
                Some(BlockStatus::Pending | BlockStatus::InFlight | BlockStatus::Done) => {}
                Some(BlockStatus::Failed) | None => {
                    status.insert(fp, BlockStatus::Done);
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// True if the fingerprint is stored or on its way to being stored.
    pub fn is_known(&self, fp: &BlockFingerprint) -> bool {
        matches!(
            self.status(fp),
            Some(BlockStatus::Pending | BlockStatus::InFlight | BlockStatus::Done)
        )
    }

    pub fn status(&self, fp: &BlockFingerprint) -> Option<BlockStatus> {
        lock(&self.status).ok().and_then(|s| s.get(fp).copied())
    }

    /// Queue a block for upload unless its fingerprint is already known.
    ///
    /// Waits while `concurrency` uploads are in flight.
    pub async fn submit(&self, fp: BlockFingerprint, data: Bytes) -> Result<Submission> {
        {
            let mut status = lock(&self.status)?;
            match status.get(&fp) {
                Some(BlockStatus::Pending | BlockStatus::InFlight | BlockStatus::Done) => {
                    self.deduplicated.fetch_add(1, Ordering::Relaxed);
                    self.deduplicated_since_drain.fetch_add(1, Ordering::Relaxed);
                    return Ok(Submission::Deduplicated);
                }
                Some(BlockStatus::Failed) | None => {
                    status.insert(fp.clone(), BlockStatus::Pending);
                }
            }
        }

        // Dropping this future while it waits for a slot leaves the block
        // unstored; the guard marks it failed so it can be submitted again.
        let mut pending = PendingGuard {
            status: &self.status,
            fp: Some(fp.clone()),
        };
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::BackendIo(format!("upload slots closed: {e}")))?;
        pending.fp = None;
        lock(&self.status)?.insert(fp.clone(), BlockStatus::InFlight);

        let backend = Arc::clone(&self.backend);
        let status = Arc::clone(&self.status);
        let task = async move {
            debug!("Uploading block {} ({} bytes)", fp, data.len());
            let result = backend.put(fp.storage_name(), data).await;
            drop(permit);

            let new_status = if result.is_ok() {
                BlockStatus::Done
            } else {
                BlockStatus::Failed
            };
            if let Ok(mut map) = status.lock() {
                map.insert(fp.clone(), new_status);
            }
            (fp, result)
        };

        self.tasks
            .lock()
            .map_err(|_| EngineError::BackendIo("storage queue tasks poisoned".to_string()))?
            .spawn(task);
        Ok(Submission::Queued)
    }

    /// Wait for every submitted upload to finish.
    ///
    /// On any failure returns [`EngineError::AggregateUpload`] listing every
    /// failed fingerprint (sorted); the successful uploads stay stored and
    /// counted.
    pub async fn drain(&self) -> Result<QueueReport> {
        let mut tasks = {
            let mut guard = self
                .tasks
                .lock()
                .map_err(|_| EngineError::BackendIo("storage queue tasks poisoned".to_string()))?;
            std::mem::take(&mut *guard)
        };

        let mut uploaded = 0;
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => uploaded += 1,
                Ok((fp, Err(e))) => {
                    error!("Upload of block {} failed: {}", fp, e);
                    failed.push(fp);
                }
                Err(e) => error!("Upload task aborted: {}", e),
            }
        }

        // An aborted task never reported back; whatever it held is still in flight.
        {
            let mut status = lock(&self.status)?;
            for (fp, state) in status.iter_mut() {
                if *state == BlockStatus::InFlight {
                    *state = BlockStatus::Failed;
                    if !failed.contains(fp) {
                        failed.push(fp.clone());
                    }
                }
            }
        }

        self.uploaded.fetch_add(uploaded, Ordering::Relaxed);
        let deduplicated = self.deduplicated_since_drain.swap(0, Ordering::Relaxed);

        if !failed.is_empty() {
            failed.sort();
            return Err(EngineError::AggregateUpload { failed });
        }

        info!("Blocks up/skip: {}/{}", uploaded, deduplicated);
        Ok(QueueReport {
            uploaded,
            deduplicated,
        })
    }

    /// Fetch one block and check it still hashes to its fingerprint.
    pub async fn fetch(&self, fp: &BlockFingerprint) -> Result<Bytes> {
        let data = self.backend.get(fp.storage_name()).await?;
        let actual = Hasher::new(fp.algorithm()).fingerprint(&data);
        if &actual != fp {
            return Err(EngineError::CryptoIntegrity(format!(
                "block {fp} content hashes to {actual}"
            )));
        }
        Ok(data)
    }

    /// Fetch blocks concurrently, yielding them in input order.
    pub fn fetch_stream<'a>(
        &'a self,
        fingerprints: &'a [BlockFingerprint],
    ) -> impl Stream<Item = Result<Bytes>> + 'a {
        stream::iter(fingerprints)
            .map(move |fp| self.fetch(fp))
            .buffered(self.concurrency)
    }

    pub async fn fetch_many(&self, fingerprints: &[BlockFingerprint]) -> Result<Vec<Bytes>> {
        self.fetch_stream(fingerprints).try_collect().await
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            ..QueueStats::default()
        };
        if let Ok(status) = lock(&self.status) {
            for state in status.values() {
                match state {
                    BlockStatus::Done => stats.known += 1,
                    BlockStatus::Pending | BlockStatus::InFlight => stats.in_flight += 1,
                    BlockStatus::Failed => stats.failed += 1,
                }
            }
        }
        stats
    }
}
