//! Image embedding providers.
//!
//! Every provider returns L2-normalized vectors of a fixed dimension:
//! - `ColorHistogramEmbedder`: per-channel intensity histograms, no model files
//! - `ClipEmbedder` (feature `clip`): CLIP ViT-B/32 through fastembed

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::models::FrameImage;

/// Error type for embedding operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model configuration: {0}")]
    InvalidModel(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Static description of an embedding model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    /// Expected input shape as [height, width, channels]
    pub input_shape: [usize; 3],
    pub output_dim: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn info(&self) -> ModelInfo;

    /// Implementations run the model on the blocking pool.
    async fn embed(&self, image: Arc<FrameImage>) -> Result<Vec<f32>, EmbeddingError>;

    /// Embeds several images, one result per input in input order.
    async fn embed_batch(
        &self,
        images: &[Arc<FrameImage>],
    ) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            out.push(self.embed(Arc::clone(image)).await);
        }
        out
    }
}

/// Scale a vector to unit L2 norm. Zero vectors are returned unchanged.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

/// Build the provider selected in the config and check its output dimension.
pub fn create_provider(
    config: &EmbeddingConfig,
    cache_dir: std::path::PathBuf,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Histogram => {
            Arc::new(ColorHistogramEmbedder::new(config.dimensions)?)
        }
        #[cfg(feature = "clip")]
        EmbeddingProviderKind::Clip => Arc::new(ClipEmbedder::new(cache_dir)?),
        #[cfg(not(feature = "clip"))]
        EmbeddingProviderKind::Clip => {
            let _ = cache_dir;
            return Err(EmbeddingError::Unavailable(
                "built without the `clip` feature".to_string(),
            ));
        }
    };

    let info = provider.info();
    if info.output_dim != config.dimensions {
        return Err(EmbeddingError::InvalidModel(format!(
            "{} produces {}-dimensional vectors, config expects {}",
            info.name, info.output_dim, config.dimensions
        )));
    }

    log::info!(
        "embedding provider {} v{} ({} dims)",
        info.name,
        info.version,
        info.output_dim
    );

    Ok(provider)
}

/// Concatenated red, green and blue intensity histograms.
///
/// Deterministic and cheap; similar colour distributions land close together.
pub struct ColorHistogramEmbedder {
    bins: usize,
}

impl ColorHistogramEmbedder {
    /// `dimensions` must be a positive multiple of 3, one third per channel.
    pub fn new(dimensions: usize) -> Result<Self, EmbeddingError> {
        if dimensions == 0 || dimensions % 3 != 0 || dimensions / 3 > 256 {
            return Err(EmbeddingError::InvalidModel(format!(
                "histogram dimensions must be a multiple of 3 between 3 and 768, got {}",
                dimensions
            )));
        }
        Ok(Self {
            bins: dimensions / 3,
        })
    }
}

fn histogram(bins: usize, image: &FrameImage) -> Result<Vec<f32>, EmbeddingError> {
    let rgb = image.pixels.to_rgb8();
    let pixel_count = rgb.width() as usize * rgb.height() as usize;
    if pixel_count == 0 {
        return Err(EmbeddingError::EmbeddingFailed(format!(
            "{} has no pixels",
            image.path.display()
        )));
    }

    let mut histogram = vec![0f32; bins * 3];
    for pixel in rgb.pixels() {
        for channel in 0..3 {
            let bin = pixel[channel] as usize * bins / 256;
            histogram[channel * bins + bin] += 1.0;
        }
    }
    for value in histogram.iter_mut() {
        *value /= pixel_count as f32;
    }

    Ok(normalize(histogram))
}

#[async_trait]
impl EmbeddingProvider for ColorHistogramEmbedder {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: "color-histogram".to_string(),
            version: "1".to_string(),
            input_shape: [0, 0, 3],
            output_dim: self.bins * 3,
        }
    }

    async fn embed(&self, image: Arc<FrameImage>) -> Result<Vec<f32>, EmbeddingError> {
        let bins = self.bins;
        tokio::task::spawn_blocking(move || histogram(bins, &image))
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("embedding task failed: {}", e)))?
    }
}

#[cfg(feature = "clip")]
pub use clip::ClipEmbedder;

#[cfg(feature = "clip")]
mod clip {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};

    use super::{normalize, EmbeddingError, EmbeddingProvider, ModelInfo};
    use crate::models::FrameImage;

    const CLIP_DIMENSIONS: usize = 512;

    /// Wrapper around fastembed's CLIP image model.
    /// Uses a Mutex because fastembed's embed() requires &mut self.
    /// Inference runs on the blocking pool.
    pub struct ClipEmbedder {
        model: Arc<Mutex<ImageEmbedding>>,
    }

    impl ClipEmbedder {
        /// The model is downloaded into `cache_dir` on first use.
        pub fn new(cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
            std::fs::create_dir_all(&cache_dir).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
            })?;

            let options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true);

            let model = ImageEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }

        async fn embed_paths(
            &self,
            paths: Vec<PathBuf>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let model = Arc::clone(&self.model);
            tokio::task::spawn_blocking(move || {
                let mut model = model.lock().map_err(|e| {
                    EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
                })?;

                let embeddings = model
                    .embed(paths, None)
                    .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

                Ok(embeddings.into_iter().map(normalize).collect())
            })
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("embedding task failed: {}", e)))?
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ClipEmbedder {
        fn info(&self) -> ModelInfo {
            ModelInfo {
                name: "clip-vit-b32".to_string(),
                version: "1".to_string(),
                input_shape: [224, 224, 3],
                output_dim: CLIP_DIMENSIONS,
            }
        }

        async fn embed(&self, image: Arc<FrameImage>) -> Result<Vec<f32>, EmbeddingError> {
            self.embed_paths(vec![image.path.clone()])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
        }

        async fn embed_batch(
            &self,
            images: &[Arc<FrameImage>],
        ) -> Vec<Result<Vec<f32>, EmbeddingError>> {
            let paths = images.iter().map(|image| image.path.clone()).collect();
            match self.embed_paths(paths).await {
                Ok(vectors) if vectors.len() == images.len() => vectors.into_iter().map(Ok).collect(),
                Ok(vectors) => {
                    let err = EmbeddingError::EmbeddingFailed(format!(
                        "expected {} embeddings, got {}",
                        images.len(),
                        vectors.len()
                    ));
                    images.iter().map(|_| Err(err.clone())).collect()
                }
                Err(e) => images.iter().map(|_| Err(e.clone())).collect(),
            }
        }
    }

}
