//! Video-level orchestration.
//!
//! Drives one video through probing, batched frame processing, persistence,
//! scene grouping and relationship tracking, and runs the queue loop used by
//! the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use serde::Serialize;
use tracing::Instrument;

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::eid::Eid;
use crate::frame::extractor::{ExtractError, FfmpegExtractor, FrameRange, FrameSource};
use crate::frame::relationship::RelationshipTracker;
use crate::frame::{FrameProcessor, ProcessError};
use crate::models::{Frame, Video, VideoStatus};
use crate::predict::PredictionRegistry;
use crate::probe::{Ffprobe, MediaProbe, ProbeError};
use crate::queue::{QueueError, VideoQueue};
use crate::report::{ErrorKind, ErrorReporter};
use crate::store::{FrameStore, StoreError};
use crate::vector::{create_provider, EmbeddingError, IndexError, VectorIndex, VectorStore};

/// Pause after a failed queue read before trying again
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("video {0} not found")]
    VideoNotFound(Eid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("frame processing failed: {0}")]
    Process(#[from] ProcessError),

    #[error("vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("embedding provider error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("processing cancelled")]
    Cancelled,
}

/// Counts for one processed video.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VideoSummary {
    pub video_id: Eid,
    pub frames_extracted: usize,
    pub frames_processed: usize,
    pub frames_failed: usize,
    pub relationships: usize,
    pub relationship_failures: usize,
}

pub struct VideoService {
    store: FrameStore,
    probe: Arc<dyn MediaProbe>,
    processor: Arc<FrameProcessor>,
    tracker: RelationshipTracker,
    reporter: ErrorReporter,
    uploads_dir: PathBuf,
    batch_size: u32,
    frame_rate: f64,
}

impl VideoService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: FrameStore,
        probe: Arc<dyn MediaProbe>,
        processor: Arc<FrameProcessor>,
        tracker: RelationshipTracker,
        reporter: ErrorReporter,
        uploads_dir: PathBuf,
        batch_size: u32,
        frame_rate: f64,
    ) -> Self {
        Self {
            store,
            probe,
            processor,
            tracker,
            reporter,
            uploads_dir,
            batch_size: batch_size.max(1),
            frame_rate,
        }
    }

    /// Wire up the ffmpeg-backed pipeline described by `config`.
    ///
    /// The prediction registry starts empty; callers register providers on
    /// the returned registry handle.
    pub fn from_config(
        config: &Config,
        store: FrameStore,
        reporter: ErrorReporter,
    ) -> Result<(Self, Arc<PredictionRegistry>), ServiceError> {
        let embedder = create_provider(
            &config.embedding,
            config.resolve(&config.embedding.cache_dir),
        )?;
        let vector_store: Arc<dyn VectorStore> = Arc::new(store.clone());
        let index = Arc::new(VectorIndex::new(
            vector_store,
            config.embedding.dimensions,
            &config.index,
        ));

        let extractor = FfmpegExtractor::new(&config.extractor);
        let frame_rate = extractor.frame_rate();
        let source: Arc<dyn FrameSource> = Arc::new(extractor);
        let registry = Arc::new(PredictionRegistry::new());

        let processor = Arc::new(FrameProcessor::new(
            &config.processor,
            config.resolve(&config.frames_dir),
            source,
            embedder,
            Arc::clone(&registry),
            Arc::clone(&index),
            reporter.clone(),
        ));
        let tracker = RelationshipTracker::new(index, store.clone(), config.relationships.clone());

        let service = Self::new(
            store,
            Arc::new(Ffprobe::new(&config.extractor)),
            processor,
            tracker,
            reporter,
            config.resolve(&config.uploads_dir),
            config.processor.batch_size,
            frame_rate,
        );
        Ok((service, registry))
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        self.processor.index()
    }

    /// Copy `source` into the uploads directory and record it as a new video.
    pub async fn register_video(&self, source: &Path) -> Result<Video, ServiceError> {
        let mut video = Video::new(source);
        self.store.save_video(&video).await?;

        tokio::fs::create_dir_all(&self.uploads_dir).await?;
        let file_name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", video.id, ext),
            None => video.id.to_string(),
        };
        let target = self.uploads_dir.join(file_name);
        if let Err(e) = tokio::fs::copy(source, &target).await {
            self.store
                .set_video_status(&video.id, VideoStatus::Error, Some(&e.to_string()))
                .await?;
            return Err(e.into());
        }

        video.source = target;
        video.updated_at = chrono::Utc::now();
        self.store.save_video(&video).await?;

        log::info!("registered video {} from {}", video.id, source.display());
        Ok(video)
    }

    /// Process a registered video end to end.
    ///
    /// Any failure that stops the video marks it `error` with the message;
    /// frames and relationships persisted up to that point are kept.
    pub async fn process_video(
        &self,
        id: &Eid,
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> Result<VideoSummary, ServiceError> {
        let video = self
            .store
            .get_video(id)
            .await?
            .ok_or_else(|| ServiceError::VideoNotFound(id.clone()))?;

        match self.run_video(&video, cancel, progress).await {
            Ok(summary) => {
                self.store
                    .set_video_status(id, VideoStatus::Complete, None)
                    .await?;
                log::info!(
                    "video {} complete: {}/{} frames, {} relationships",
                    id,
                    summary.frames_processed,
                    summary.frames_extracted,
                    summary.relationships
                );
                Ok(summary)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(status_err) = self
                    .store
                    .set_video_status(id, VideoStatus::Error, Some(&message))
                    .await
                {
                    self.reporter.report(
                        ErrorKind::Persistence,
                        format!("video {} status", id),
                        status_err,
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_video(
        &self,
        video: &Video,
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> Result<VideoSummary, ServiceError> {
        let metadata = self.probe.probe(&video.source).await?;
        self.store.set_video_metadata(&video.id, &metadata).await?;
        self.store
            .set_video_status(&video.id, VideoStatus::Processing, None)
            .await?;

        let total = frame_count(metadata.duration, self.frame_rate);
        progress.set_length(total as u64);
        log::info!(
            "video {}: {:.1}s at {} fps, {} frames",
            video.id,
            metadata.duration,
            self.frame_rate,
            total
        );

        let mut summary = VideoSummary {
            video_id: video.id.clone(),
            ..VideoSummary::default()
        };
        let mut frames: Vec<Frame> = Vec::new();

        self.processor.reset_motion();
        for range in batches(total, self.batch_size) {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            let results = self
                .processor
                .process_batch(&video.id, &video.source, range, cancel)
                .await
                .map_err(|e| match e {
                    ProcessError::Extract(ExtractError::Cancelled) => ServiceError::Cancelled,
                    e => ServiceError::Process(e),
                })?;

            for result in results {
                summary.frames_extracted += 1;
                if let Some(e) = &result.error {
                    log::debug!("frame {} skipped: {}", result.frame.number, e);
                    summary.frames_failed += 1;
                    continue;
                }
                match self.store.save_frame(&result.frame).await {
                    Ok(()) => {
                        summary.frames_processed += 1;
                        frames.push(result.frame);
                    }
                    Err(e) => {
                        summary.frames_failed += 1;
                        self.reporter.report(
                            ErrorKind::Persistence,
                            format!("video {} frame {}", video.id, result.frame.number),
                            e,
                        );
                    }
                }
            }
            progress.inc(range.len() as u64);

            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
        }

        // similarity lookups only see persisted vectors
        self.index().flush().await?;

        for frame in &frames {
            if let Some(scene) = frame.scene() {
                self.store
                    .assign_scene(&frame.id, &scene_id(&video.id, scene))
                    .await?;
            }
        }

        for frame in frames.iter_mut() {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
            match self.tracker.track_relationships(frame).await {
                Ok(relationships) => summary.relationships += relationships.len(),
                Err(e) => {
                    summary.relationship_failures += 1;
                    self.reporter.report(
                        ErrorKind::Relationship,
                        format!("frame {}", frame.id),
                        e,
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Process queued videos until `cancel` fires.
    pub async fn run(&self, queue: &dyn VideoQueue, cancel: &CancellationToken) {
        log::info!("waiting for videos");
        loop {
            let id = match queue.pop(cancel).await {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => {
                    self.reporter.report(ErrorKind::Connectivity, "video queue", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_RETRY_DELAY) => continue,
                    }
                }
            };

            log::info!("processing video {}", id);
            let progress = ProgressBar::hidden();
            if let Err(e) = self
                .process_video(&id, cancel, &progress)
                .instrument(tracing::info_span!("video", id = %id))
                .await
            {
                self.reporter
                    .report(ErrorKind::Extraction, format!("video {}", id), e);
            }
        }
        log::info!("video queue stopped");
    }
}

/// Frames produced when sampling `duration` seconds at `frame_rate`.
pub fn frame_count(duration: f64, frame_rate: f64) -> u32 {
    if duration.is_nan() || frame_rate.is_nan() || duration <= 0.0 || frame_rate <= 0.0 {
        return 0;
    }
    (duration * frame_rate).ceil().min(u32::MAX as f64) as u32
}

/// Consecutive inclusive ranges of at most `batch_size` frames covering
/// `0..total`.
pub fn batches(total: u32, batch_size: u32) -> Vec<FrameRange> {
    let batch_size = batch_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0u32;
    while start < total {
        let end = start.saturating_add(batch_size).min(total) - 1;
        ranges.push(FrameRange::new(start, end));
        start = end + 1;
    }
    ranges
}

/// Scene grouping key: scenes never span videos.
pub fn scene_id(video_id: &Eid, label: &str) -> String {
    format!("{}:{}", video_id, label)
}
