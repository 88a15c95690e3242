//! Asynchronous error reporting.
//!
//! Reports go through a bounded channel to a dedicated consumer task that
//! writes them to the log. Reporting never blocks: when the channel is full
//! (or the consumer is gone) the report is logged synchronously by the
//! caller instead and counted as an overflow.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Extraction,
    Analysis,
    Prediction,
    Persistence,
    Relationship,
    Shutdown,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    fn log(&self, overflow: bool) {
        if overflow {
            log::error!(
                "[{:?}] {}: {} (reported synchronously, queue full)",
                self.kind,
                self.context,
                self.message
            );
        } else {
            log::error!("[{:?}] {}: {}", self.kind, self.context, self.message);
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorReport>,
    overflowed: Arc<AtomicU64>,
}

/// Receiving half, drained by [`ReportConsumer::run`].
pub struct ReportConsumer {
    rx: mpsc::Receiver<ErrorReport>,
}

impl ErrorReporter {
    pub fn new(capacity: usize) -> (Self, ReportConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                overflowed: Arc::new(AtomicU64::new(0)),
            },
            ReportConsumer { rx },
        )
    }

    /// Create a reporter and spawn its consumer. The task finishes once
    /// every reporter clone has been dropped and returns how many reports it
    /// handled.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<u64>) {
        let (reporter, consumer) = Self::new(capacity);
        (reporter, tokio::spawn(consumer.run()))
    }

    pub fn report(&self, kind: ErrorKind, context: impl Into<String>, error: impl Display) {
        let report = ErrorReport {
            kind,
            context: context.into(),
            message: format!("{:#}", error),
            at: Utc::now(),
        };

        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) | Err(TrySendError::Closed(report)) => {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                report.log(true);
            }
        }
    }

    /// Reports that bypassed the queue.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

impl ReportConsumer {
    pub async fn run(mut self) -> u64 {
        let mut handled = 0;
        while let Some(report) = self.rx.recv().await {
            report.log(false);
            handled += 1;
        }
        log::debug!("error reporter stopped after {} reports", handled);
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_reach_consumer() {
        let (reporter, consumer) = ErrorReporter::spawn(10);
        reporter.report(ErrorKind::Analysis, "frame 1", "decode failed");
        reporter.report(ErrorKind::Prediction, "frame 2", "model missing");
        drop(reporter);

        assert_eq!(consumer.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_overflow_falls_back_to_sync_log() {
        let (reporter, consumer) = ErrorReporter::new(1);

        reporter.report(ErrorKind::Persistence, "flush", "disk full");
        reporter.report(ErrorKind::Persistence, "flush", "disk full again");
        reporter.report(ErrorKind::Persistence, "flush", "still full");
        assert_eq!(reporter.overflowed(), 2);

        drop(reporter);
        assert_eq!(consumer.run().await, 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_counts_as_overflow() {
        let (reporter, consumer) = ErrorReporter::new(4);
        drop(consumer);

        reporter.report(ErrorKind::Shutdown, "daemon", "late error");
        assert_eq!(reporter.overflowed(), 1);
    }
}
