//! Per-frame analysis pipeline.
//!
//! # Architecture
//!
//! - `extractor`: Produces frame images for a range of a video (ffmpeg)
//! - `content`: Dimensions, colour statistics, edge strength and motion
//! - `relationship`: Links between processed frames
//!
//! A batch is extracted first, then frames are admitted through a semaphore
//! and analyzed on their own tasks. Within a frame, quality, embedding and
//! content analysis run concurrently and write into the frame record under a
//! lock; predictions run only once all three succeeded.

pub mod content;
pub mod extractor;
pub mod relationship;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::cancel::CancellationToken;
use crate::config::ProcessorConfig;
use crate::eid::Eid;
use crate::models::{
    Frame, FrameImage, ReservedKeyError, Resolution, META_FACES, META_OBJECTS, META_SCENE,
};
use crate::predict::{Prediction, PredictionKind, PredictionRegistry};
use crate::quality::{QualityAnalyzer, QualityError};
use crate::report::{ErrorKind, ErrorReporter};
use crate::vector::{EmbeddingError, EmbeddingProvider, IndexError, VectorEntry, VectorIndex};

use content::{analyze_content, MotionEstimator};
use extractor::{ExtractError, ExtractedFrame, FrameRange, FrameSource};

/// Failure of one of the concurrent per-frame analyses.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("quality analysis failed: {0}")]
    Quality(#[from] QualityError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("embedding has {got} dimensions, index expects {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("content analysis wrote a reserved key: {0}")]
    Metadata(#[from] ReservedKeyError),

    #[error("{0} analysis task failed: {1}")]
    Task(&'static str, String),
}

/// Every analysis failure of a single frame.
#[derive(Debug)]
pub struct AnalysisErrors(pub Vec<AnalysisError>);

impl fmt::Display for AnalysisErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for AnalysisErrors {}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{0}")]
    Analysis(AnalysisErrors),

    #[error("vector index insert failed: {0}")]
    Index(#[from] IndexError),

    #[error("frame task failed: {0}")]
    Task(String),

    #[error("batch cancelled before the frame was started")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("frame extraction failed: {0}")]
    Extract(#[from] ExtractError),
}

/// Outcome of one frame. A frame with an error was not inserted into the
/// vector index.
#[derive(Debug)]
pub struct ProcessResult {
    pub frame: Frame,
    pub error: Option<FrameError>,
}

impl ProcessResult {
    fn ok(frame: Frame) -> Self {
        Self { frame, error: None }
    }

    fn failed(frame: Frame, error: FrameError) -> Self {
        Self {
            frame,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct FrameProcessor {
    source: Arc<dyn FrameSource>,
    quality: QualityAnalyzer,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<PredictionRegistry>,
    index: Arc<VectorIndex>,
    motion: Arc<MotionEstimator>,
    admission: Arc<Semaphore>,
    frames_dir: PathBuf,
    reporter: ErrorReporter,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FrameProcessor {
    pub fn new(
        config: &ProcessorConfig,
        frames_dir: PathBuf,
        source: Arc<dyn FrameSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<PredictionRegistry>,
        index: Arc<VectorIndex>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            source,
            quality: QualityAnalyzer::new(),
            embedder,
            registry,
            index,
            motion: Arc::new(MotionEstimator::new()),
            admission: Arc::new(Semaphore::new(config.max_workers.max(1))),
            frames_dir,
            reporter,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Forget the previous frame used for motion, e.g. between videos.
    pub fn reset_motion(&self) {
        self.motion.reset();
    }

    /// Extract and analyze the frames of `range`.
    ///
    /// Returns one result per extracted frame in frame-number order. Once
    /// `cancel` fires no further frames are admitted; those are returned
    /// with [`FrameError::Cancelled`] while admitted frames run to the end.
    pub async fn process_batch(
        self: &Arc<Self>,
        video_id: &Eid,
        video: &Path,
        range: FrameRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProcessResult>, ProcessError> {
        let out_dir = self
            .frames_dir
            .join(video_id.as_str())
            .join(format!("batch_{}", range.start));
        let extracted = self
            .source
            .extract_range(video, &out_dir, range, cancel)
            .await?;

        log::info!(
            "video {}: processing {} frames of {}..={}",
            video_id,
            extracted.len(),
            range.start,
            range.end
        );

        let mut running = Vec::with_capacity(extracted.len());
        let mut abandoned = Vec::new();
        for frame in extracted {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&self.admission).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                abandoned.push(frame);
                continue;
            };

            let processor = Arc::clone(self);
            let id = video_id.clone();
            let task_frame = frame.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                processor.process_frame(id, task_frame).await
            });
            running.push((frame, handle));
        }

        let mut results = Vec::with_capacity(running.len() + abandoned.len());
        for (frame, handle) in running {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => ProcessResult::failed(
                    Frame::new(video_id.clone(), frame.number, frame.timestamp, frame.path),
                    FrameError::Task(e.to_string()),
                ),
            };
            if let Some(error) = &result.error {
                self.reporter.report(
                    ErrorKind::Analysis,
                    format!("video {} frame {}", video_id, result.frame.number),
                    error,
                );
            }
            results.push(result);
        }

        if !abandoned.is_empty() {
            log::warn!(
                "video {}: batch cancelled, {} frames not started",
                video_id,
                abandoned.len()
            );
        }
        for frame in abandoned {
            results.push(ProcessResult::failed(
                Frame::new(video_id.clone(), frame.number, frame.timestamp, frame.path),
                FrameError::Cancelled,
            ));
        }

        Ok(results)
    }

    /// Analyze one extracted frame and buffer its vector.
    pub async fn process_frame(&self, video_id: Eid, extracted: ExtractedFrame) -> ProcessResult {
        let mut frame = Frame::new(
            video_id,
            extracted.number,
            extracted.timestamp,
            extracted.path.clone(),
        );

        let path = extracted.path.clone();
        let image = match tokio::task::spawn_blocking(move || FrameImage::open(path)).await {
            Ok(Ok(image)) => Arc::new(image),
            Ok(Err(source)) => {
                return ProcessResult::failed(
                    frame,
                    FrameError::Decode {
                        path: extracted.path,
                        source,
                    },
                )
            }
            Err(e) => return ProcessResult::failed(frame, FrameError::Task(e.to_string())),
        };

        frame.resolution = Resolution {
            width: image.pixels.width(),
            height: image.pixels.height(),
        };
        let rgb = Arc::new(image.pixels.to_rgb8());
        let record = Mutex::new(frame);
        let dimensions = self.index.dimensions();

        let quality = async {
            let rgb = Arc::clone(&rgb);
            let analyzer = self.quality;
            let metrics = tokio::task::spawn_blocking(move || analyzer.analyze_rgb(&rgb))
                .await
                .map_err(|e| AnalysisError::Task("quality", e.to_string()))??;
            lock(&record).quality = metrics;
            Ok::<(), AnalysisError>(())
        };

        let embedding = async {
            let vector = self.embedder.embed(Arc::clone(&image)).await?;
            if vector.len() != dimensions {
                return Err(AnalysisError::Dimension {
                    expected: dimensions,
                    got: vector.len(),
                });
            }
            lock(&record).vector = Some(vector);
            Ok::<(), AnalysisError>(())
        };

        let content = async {
            let rgb = Arc::clone(&rgb);
            let motion = Arc::clone(&self.motion);
            let summary = tokio::task::spawn_blocking(move || analyze_content(rgb, &motion))
                .await
                .map_err(|e| AnalysisError::Task("content", e.to_string()))?;
            let mut frame = lock(&record);
            for (key, value) in summary.into_metadata() {
                frame.insert_metadata(key, value)?;
            }
            Ok::<(), AnalysisError>(())
        };

        let (quality, embedding, content) = tokio::join!(quality, embedding, content);
        let errors: Vec<AnalysisError> = [quality, embedding, content]
            .into_iter()
            .filter_map(Result::err)
            .collect();

        let mut frame = record.into_inner().unwrap_or_else(|e| e.into_inner());
        if !errors.is_empty() {
            return ProcessResult::failed(frame, FrameError::Analysis(AnalysisErrors(errors)));
        }

        self.apply_predictions(&mut frame, image).await;

        if let Some(vector) = frame.vector.clone() {
            let entry = VectorEntry {
                id: frame.id.clone(),
                vector,
                metadata: frame.metadata.clone(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.index.insert(entry).await {
                return ProcessResult::failed(frame, FrameError::Index(e));
            }
        }

        frame.updated_at = Utc::now();
        ProcessResult::ok(frame)
    }

    async fn apply_predictions(&self, frame: &mut Frame, image: Arc<FrameImage>) {
        let outcomes = match self.registry.infer(image).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.reporter
                    .report(ErrorKind::Prediction, format!("frame {}", frame.id), e);
                return;
            }
        };

        for outcome in outcomes {
            match outcome.result {
                Ok(predictions) => merge_predictions(frame, outcome.kind, predictions),
                Err(e) => self.reporter.report(
                    ErrorKind::Prediction,
                    format!("frame {} {}", frame.id, outcome.kind.as_str()),
                    e,
                ),
            }
        }
    }
}

/// Write one provider's predictions into the frame metadata.
fn merge_predictions(frame: &mut Frame, kind: PredictionKind, predictions: Vec<Prediction>) {
    match kind {
        PredictionKind::ObjectDetection => frame.set_reserved(META_OBJECTS, json!(predictions)),
        PredictionKind::FaceDetection => frame.set_reserved(META_FACES, json!(predictions)),
        PredictionKind::SceneClassification => {
            let top = predictions.into_iter().max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if let Some(top) = top {
                frame.set_reserved(META_SCENE, json!(top.label));
            }
        }
        PredictionKind::ActionRecognition => {
            // not reserved; cannot fail
            let _ = frame.insert_metadata("actions", json!(predictions));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(Eid::new(), 0, 0.0, PathBuf::from("frame-0.jpg"))
    }

    #[test]
    fn test_merge_predictions_by_kind() {
        let mut frame = frame();
        merge_predictions(
            &mut frame,
            PredictionKind::ObjectDetection,
            vec![Prediction::new("dog", 0.8)],
        );
        merge_predictions(
            &mut frame,
            PredictionKind::SceneClassification,
            vec![
                Prediction::new("indoor", 0.3),
                Prediction::new("beach", 0.9),
                Prediction::new("forest", 0.5),
            ],
        );
        merge_predictions(&mut frame, PredictionKind::FaceDetection, vec![]);

        assert_eq!(frame.metadata["objects"][0]["label"], json!("dog"));
        assert_eq!(frame.scene(), Some("beach"));
        assert_eq!(frame.metadata["faces"], json!([]));
    }

    #[test]
    fn test_empty_scene_prediction_leaves_scene_unset() {
        let mut frame = frame();
        merge_predictions(&mut frame, PredictionKind::SceneClassification, vec![]);
        assert_eq!(frame.scene(), None);
    }

    #[test]
    fn test_analysis_errors_display_all() {
        let errors = AnalysisErrors(vec![
            AnalysisError::Task("quality", "panicked".to_string()),
            AnalysisError::Dimension {
                expected: 3,
                got: 2,
            },
        ]);
        let text = errors.to_string();
        assert!(text.contains("quality analysis task failed"));
        assert!(text.contains("index expects 3"));
    }
}
