//! Buffered vector index with batched, transactional persistence.
//!
//! Inserts land in an in-memory buffer. The buffer is flushed when it
//! reaches the configured batch size (synchronously, by the inserting
//! caller), on a coalesced signal raised by every other insert, and on a
//! periodic tick. A flush swaps the buffer out under the lock and performs
//! the I/O after releasing it, so inserts never wait on the store and every
//! size-triggered flush carries exactly one full batch. Writes themselves are
//! serialized: a flush returns only after any write already in progress has
//! reached the store.
//!
//! Failed flushes are not retried: the swapped-out entries are dropped and
//! their ids are returned in the error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cancel::CancellationToken;
use crate::config::IndexConfig;
use crate::eid::Eid;
use crate::report::{ErrorKind, ErrorReporter};
use crate::store::StoreError;

/// Buffer unit, one per embedded frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Id of the frame the vector belongs to
    pub id: Eid,
    pub vector: Vec<f32>,
    /// Frame metadata at insertion time
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: Eid,
    /// Dot product with the query
    pub score: f32,
}

/// Persistence backend for flushed vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert a batch inside a single transaction; all or nothing.
    async fn upsert_vectors(&self, batch: &[VectorEntry]) -> Result<(), StoreError>;

    async fn load_vector(&self, id: &Eid) -> Result<Option<Vec<f32>>, StoreError>;

    /// Every stored vector, in storage order.
    async fn scan_vectors(&self) -> Result<Vec<(Eid, Vec<f32>)>, StoreError>;
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector buffer lock poisoned")]
    LockPoisoned,

    #[error("Flush of {} vectors failed: {source}", .dropped.len())]
    FlushFailed {
        /// Ids whose entries were dropped from the buffer
        dropped: Vec<Eid>,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Counters describing flush activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Flushes run by an inserting caller because the buffer was full
    pub size_triggered: u64,
    /// Background flushes (tick or signal) that found something to write
    pub background: u64,
    pub failed: u64,
    pub flushed_entries: u64,
}

pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    dimensions: usize,
    batch_size: usize,
    flush_interval: Duration,
    buffer: Mutex<Vec<VectorEntry>>,
    flush_signal: Notify,
    writing: AsyncMutex<()>,
    size_triggered: AtomicU64,
    background: AtomicU64,
    failed: AtomicU64,
    flushed_entries: AtomicU64,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn VectorStore>, dimensions: usize, config: &IndexConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            store,
            dimensions,
            batch_size,
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            flush_signal: Notify::new(),
            writing: AsyncMutex::new(()),
            size_triggered: AtomicU64::new(0),
            background: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            flushed_entries: AtomicU64::new(0),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of entries waiting for the next flush.
    pub fn buffered_len(&self) -> Result<usize, IndexError> {
        Ok(self.lock_buffer()?.len())
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            size_triggered: self.size_triggered.load(Ordering::Relaxed),
            background: self.background.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushed_entries: self.flushed_entries.load(Ordering::Relaxed),
        }
    }

    /// Buffer an entry for persistence.
    ///
    /// When the buffer reaches the batch size the caller performs the flush
    /// and receives its error; otherwise the background flusher is signalled.
    pub async fn insert(&self, entry: VectorEntry) -> Result<(), IndexError> {
        if entry.vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: entry.vector.len(),
            });
        }

        let full = {
            let mut buffer = self.lock_buffer()?;
            buffer.push(entry);
            if buffer.len() >= self.batch_size {
                Some(std::mem::replace(
                    &mut *buffer,
                    Vec::with_capacity(self.batch_size),
                ))
            } else {
                None
            }
        };

        match full {
            Some(batch) => {
                self.size_triggered.fetch_add(1, Ordering::Relaxed);
                self.write(batch).await?;
            }
            // stores at most one permit, so repeated signals coalesce
            None => self.flush_signal.notify_one(),
        }

        Ok(())
    }

    /// Persist everything currently buffered.
    ///
    /// Returns the number of entries written. Waits for any flush already
    /// writing, even when the buffer is empty.
    pub async fn flush(&self) -> Result<usize, IndexError> {
        let batch = {
            let mut buffer = self.lock_buffer()?;
            if buffer.is_empty() {
                Vec::new()
            } else {
                std::mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
            }
        };
        self.write(batch).await
    }

    /// Write a swapped-out batch. Writes are serialized.
    async fn write(&self, batch: Vec<VectorEntry>) -> Result<usize, IndexError> {
        let _writing = self.writing.lock().await;
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.upsert_vectors(&batch).await {
            Ok(()) => {
                self.flushed_entries
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                log::debug!("flushed {} vectors", batch.len());
                Ok(batch.len())
            }
            Err(source) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("vector flush failed, dropping {} entries: {}", batch.len(), source);
                Err(IndexError::FlushFailed {
                    dropped: batch.into_iter().map(|entry| entry.id).collect(),
                    source,
                })
            }
        }
    }

    /// Start the background flusher.
    ///
    /// It flushes on every tick of the configured interval and whenever an
    /// insert signals. On cancellation it performs one last flush and exits.
    /// Failed flushes go to `reporter`.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        cancel: CancellationToken,
        reporter: ErrorReporter,
    ) -> JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(index.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = index.flush().await {
                            reporter.report(ErrorKind::Persistence, "final vector flush", e);
                        }
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = index.flush_signal.notified() => {}
                }

                match index.flush().await {
                    Ok(0) => {}
                    Ok(_) => {
                        index.background.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        index.background.fetch_add(1, Ordering::Relaxed);
                        reporter.report(ErrorKind::Persistence, "background vector flush", e);
                    }
                }
            }

            log::debug!("vector flusher stopped");
        })
    }

    /// Look up a persisted vector.
    pub async fn get(&self, id: &Eid) -> Result<Option<Vec<f32>>, IndexError> {
        Ok(self.store.load_vector(id).await?)
    }

    /// Ids of the `limit` stored vectors with the highest dot product.
    pub async fn find_similar(&self, query: &[f32], limit: usize) -> Result<Vec<Eid>, IndexError> {
        Ok(self
            .find_similar_scored(query, limit)
            .await?
            .into_iter()
            .map(|result| result.id)
            .collect())
    }

    /// Exact ranking over all persisted vectors.
    ///
    /// # Arguments
    /// * `query` - The query vector; stored vectors of another length are skipped
    /// * `limit` - Maximum number of results to return
    ///
    /// # Returns
    /// Results sorted by score (highest first), ties in storage order.
    pub async fn find_similar_scored(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut results: Vec<SearchResult> = self
            .store
            .scan_vectors()
            .await?
            .into_iter()
            .filter(|(_, vector)| vector.len() == query.len())
            .map(|(id, vector)| SearchResult {
                id,
                score: dot(query, &vector),
            })
            .collect();

        // stable sort keeps storage order for equal scores
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }

    fn lock_buffer(&self) -> Result<std::sync::MutexGuard<'_, Vec<VectorEntry>>, IndexError> {
        self.buffer.lock().map_err(|_| IndexError::LockPoisoned)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// In-memory store that records every committed batch.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<(Eid, Vec<f32>)>>,
        batches: Mutex<Vec<usize>>,
        fail: AtomicBool,
        latency: Duration,
    }

    #[async_trait]
    impl VectorStore for MemoryStore {
        async fn upsert_vectors(&self, batch: &[VectorEntry]) -> Result<(), StoreError> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            let mut rows = self.rows.lock().unwrap();
            for entry in batch {
                match rows.iter_mut().find(|(id, _)| *id == entry.id) {
                    Some(row) => row.1 = entry.vector.clone(),
                    None => rows.push((entry.id.clone(), entry.vector.clone())),
                }
            }
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }

        async fn load_vector(&self, id: &Eid) -> Result<Option<Vec<f32>>, StoreError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().find(|(row_id, _)| row_id == id).map(|(_, v)| v.clone()))
        }

        async fn scan_vectors(&self) -> Result<Vec<(Eid, Vec<f32>)>, StoreError> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    fn entry(id: &str, vector: Vec<f32>) -> VectorEntry {
        VectorEntry {
            id: Eid::from(id),
            vector,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    fn index(store: Arc<MemoryStore>, batch_size: usize) -> VectorIndex {
        let config = IndexConfig {
            batch_size,
            flush_interval_ms: 60_000,
        };
        VectorIndex::new(store, 3, &config)
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_synchronous_flush() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store.clone(), 2);

        index.insert(entry("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        assert_eq!(index.buffered_len().unwrap(), 1);
        assert_eq!(index.stats().size_triggered, 0);

        index.insert(entry("b", vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert_eq!(index.stats().size_triggered, 1);

        index.insert(entry("c", vec![0.0, 0.0, 1.0])).await.unwrap();
        assert_eq!(index.buffered_len().unwrap(), 1);
        assert_eq!(index.stats().size_triggered, 1);
        assert_eq!(*store.batches.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_size_triggered_flush_count() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store.clone(), 4);

        for i in 0..10 {
            index
                .insert(entry(&format!("f{i}"), vec![i as f32, 0.0, 0.0]))
                .await
                .unwrap();
        }
        assert_eq!(index.stats().size_triggered, 2);
        assert_eq!(index.buffered_len().unwrap(), 2);

        assert_eq!(index.flush().await.unwrap(), 2);
        assert_eq!(*store.batches.lock().unwrap(), vec![4, 4, 2]);
        assert_eq!(index.stats().flushed_entries, 10);
    }

    #[tokio::test]
    async fn test_flushed_ids_are_retrievable() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store, 100);

        index.insert(entry("a", vec![0.5, 0.5, 0.0])).await.unwrap();
        assert_eq!(index.get(&Eid::from("a")).await.unwrap(), None);

        index.flush().await.unwrap();
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert_eq!(
            index.get(&Eid::from("a")).await.unwrap(),
            Some(vec![0.5, 0.5, 0.0])
        );
        assert_eq!(index.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store.clone(), 100);

        index.insert(entry("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        index.insert(entry("b", vec![0.0, 1.0, 0.0])).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        match index.flush().await {
            Err(IndexError::FlushFailed { dropped, .. }) => {
                assert_eq!(dropped, vec![Eid::from("a"), Eid::from("b")]);
            }
            other => panic!("expected flush failure, got {other:?}"),
        }
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert_eq!(index.stats().failed, 1);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(index.flush().await.unwrap(), 0);
        assert_eq!(index.get(&Eid::from("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_rejects_wrong_dimension() {
        let index = index(Arc::new(MemoryStore::default()), 2);
        let err = index.insert(entry("a", vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                got: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_find_similar_ranking() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store, 100);

        let vectors = [
            ("f1", vec![1.0, 0.0, 0.0]),
            ("f2", vec![0.9, 0.1, 0.0]),
            ("f3", vec![0.0, 1.0, 0.0]),
            ("f4", vec![0.0, 0.0, 1.0]),
            ("f5", vec![-1.0, 0.0, 0.0]),
        ];
        for (id, vector) in vectors {
            index.insert(entry(id, vector)).await.unwrap();
        }
        index.flush().await.unwrap();

        let ids = index.find_similar(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(ids, vec![Eid::from("f1"), Eid::from("f2")]);

        let all = index.find_similar_scored(&[1.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(all.last().unwrap().id, Eid::from("f5"));

        assert!(index.find_similar(&[1.0, 0.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_similar_ties_keep_storage_order() {
        let store = Arc::new(MemoryStore::default());
        let index = index(store, 100);
        for id in ["x", "y", "z"] {
            index.insert(entry(id, vec![0.0, 1.0, 0.0])).await.unwrap();
        }
        index.flush().await.unwrap();

        let ids = index.find_similar(&[0.0, 1.0, 0.0], 3).await.unwrap();
        assert_eq!(ids, vec![Eid::from("x"), Eid::from("y"), Eid::from("z")]);
    }

    #[tokio::test]
    async fn test_background_flusher_drains_on_signal_and_cancel() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(index(store.clone(), 100));
        let cancel = CancellationToken::new();
        let (reporter, _consumer) = ErrorReporter::new(8);
        let flusher = index.spawn_flusher(cancel.clone(), reporter);

        index.insert(entry("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        for _ in 0..100 {
            if index.buffered_len().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert!(index.stats().background >= 1);

        index.insert(entry("b", vec![0.0, 1.0, 0.0])).await.unwrap();
        cancel.cancel();
        flusher.await.unwrap();
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert!(index.get(&Eid::from("b")).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_flush_full_batches() {
        let store = Arc::new(MemoryStore {
            latency: Duration::from_millis(50),
            ..Default::default()
        });
        let index = Arc::new(index(store.clone(), 2));

        let mut tasks = Vec::new();
        for i in 0..6 {
            let index = Arc::clone(&index);
            tasks.push(tokio::spawn(async move {
                index
                    .insert(entry(&format!("f{i}"), vec![i as f32, 1.0, 0.0]))
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(index.stats().size_triggered, 3);
        assert_eq!(*store.batches.lock().unwrap(), vec![2, 2, 2]);
        assert_eq!(index.buffered_len().unwrap(), 0);
        assert_eq!(index.stats().flushed_entries, 6);
    }

    #[tokio::test]
    async fn test_idle_flusher_counts_nothing() {
        let store = Arc::new(MemoryStore::default());
        let config = IndexConfig {
            batch_size: 100,
            flush_interval_ms: 5,
        };
        let index = Arc::new(VectorIndex::new(store.clone(), 3, &config));
        let cancel = CancellationToken::new();
        let (reporter, _consumer) = ErrorReporter::new(8);
        let flusher = index.spawn_flusher(cancel.clone(), reporter);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        flusher.await.unwrap();

        assert_eq!(index.stats().background, 0);
        assert!(store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_background_flush_failure_is_reported() {
        let store = Arc::new(MemoryStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let index = Arc::new(index(store.clone(), 100));
        let cancel = CancellationToken::new();
        let (reporter, consumer) = ErrorReporter::new(8);
        let flusher = index.spawn_flusher(cancel.clone(), reporter);

        index.insert(entry("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        for _ in 0..100 {
            if index.stats().failed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        flusher.await.unwrap();

        assert_eq!(index.stats().failed, 1);
        assert_eq!(index.stats().background, 1);
        // the flusher's reporter is gone, so the consumer drains and stops
        assert_eq!(consumer.run().await, 1);
    }
}
