//! Source of video ids waiting to be processed.
//!
//! The spool queue is a directory of marker files named `<video id>.pending`.
//! Writers create the marker under a temporary name and rename it into place,
//! so a reader never sees a half-written marker. Video ids are ULIDs, which
//! makes name order creation order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::eid::Eid;

const PENDING_EXT: &str = "pending";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait VideoQueue: Send + Sync {
    /// Wait for the next video id. Returns `None` once `cancel` fires.
    async fn pop(&self, cancel: &CancellationToken) -> Result<Option<Eid>, QueueError>;
}

pub struct SpoolQueue {
    dir: PathBuf,
    poll: Duration,
}

impl SpoolQueue {
    pub fn new(dir: impl Into<PathBuf>, poll: Duration) -> Result<Self, QueueError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| QueueError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, poll })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn enqueue(&self, id: &Eid) -> Result<(), QueueError> {
        let tmp = self.dir.join(format!(".{}.tmp", id));
        let marker = self.dir.join(format!("{}.{}", id, PENDING_EXT));

        tokio::fs::write(&tmp, id.as_bytes())
            .await
            .map_err(|source| QueueError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &marker)
            .await
            .map_err(|source| QueueError::Io {
                path: marker.clone(),
                source,
            })?;

        log::debug!("enqueued video {}", id);
        Ok(())
    }

    /// Pending ids in queue order.
    pub async fn pending(&self) -> Result<Vec<Eid>, QueueError> {
        let io_err = |source| QueueError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PENDING_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(Eid::from(stem));
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Remove and return the oldest marker, if any.
    async fn take_next(&self) -> Result<Option<Eid>, QueueError> {
        for id in self.pending().await? {
            let marker = self.dir.join(format!("{}.{}", id, PENDING_EXT));
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => return Ok(Some(id)),
                // claimed by another reader in the meantime
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(QueueError::Io {
                        path: marker,
                        source,
                    })
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl VideoQueue for SpoolQueue {
    async fn pop(&self, cancel: &CancellationToken) -> Result<Option<Eid>, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(id) = self.take_next().await? {
                return Ok(Some(id));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path(), Duration::from_millis(10)).unwrap();
        let cancel = CancellationToken::new();

        let first = Eid::from("01A");
        let second = Eid::from("01B");
        queue.enqueue(&second).await.unwrap();
        queue.enqueue(&first).await.unwrap();
        std::fs::write(dir.path().join("README"), "not a marker").unwrap();

        assert_eq!(queue.pending().await.unwrap(), vec![first.clone(), second.clone()]);
        assert_eq!(queue.pop(&cancel).await.unwrap(), Some(first));
        assert_eq!(queue.pop(&cancel).await.unwrap(), Some(second));
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(
            SpoolQueue::new(dir.path(), Duration::from_millis(10)).unwrap(),
        );
        let cancel = CancellationToken::new();

        let writer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.enqueue(&Eid::from("late")).await.unwrap();
        });

        assert_eq!(queue.pop(&cancel).await.unwrap(), Some(Eid::from("late")));
    }

    #[tokio::test]
    async fn test_pop_returns_none_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert_eq!(queue.pop(&cancel).await.unwrap(), None);
    }
}
