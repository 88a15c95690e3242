use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::RelationType;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_DATABASE_URL: &str = "sqlite://frameindex.db";
const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_BACKOFF_SECS: u64 = 2;

/// Frames extracted per second of video
const DEFAULT_FRAME_RATE: f64 = 1.0;
/// ffmpeg `-q:v`, 1 (best) to 31 (worst)
const DEFAULT_OUTPUT_QUALITY: u8 = 2;

const DEFAULT_PROCESSOR_BATCH_SIZE: u32 = 100;
const DEFAULT_MAX_WORKERS: usize = 4;

const DEFAULT_INDEX_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

const DEFAULT_MAX_SIMILAR_FRAMES: usize = 5;
const DEFAULT_TEMPORAL_WINDOW: u32 = 5;

const DEFAULT_REPORTER_CAPACITY: usize = 100;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_QUEUE_POLL_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,

    /// JPEG quality passed to ffmpeg, lower is better
    #[serde(default = "default_output_quality")]
    pub output_quality: u8,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            frame_rate: DEFAULT_FRAME_RATE,
            output_quality: DEFAULT_OUTPUT_QUALITY,
        }
    }
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_frame_rate() -> f64 {
    DEFAULT_FRAME_RATE
}

fn default_output_quality() -> u8 {
    DEFAULT_OUTPUT_QUALITY
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Frames per extraction batch
    #[serde(default = "default_processor_batch_size")]
    pub batch_size: u32,

    /// Frames analyzed concurrently within a batch
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PROCESSOR_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

fn default_processor_batch_size() -> u32 {
    DEFAULT_PROCESSOR_BATCH_SIZE
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Buffered entries that force a synchronous flush
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_INDEX_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

fn default_index_batch_size() -> usize {
    DEFAULT_INDEX_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Colour histogram, no model download
    Histogram,
    /// CLIP image model, requires the `clip` feature
    Clip,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,

    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,

    /// Where downloaded models are cached, relative to the base path
    #[serde(default = "default_model_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            cache_dir: default_model_cache_dir(),
        }
    }
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Histogram
}

fn default_embedding_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

fn default_model_cache_dir() -> PathBuf {
    PathBuf::from("models")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipConfig {
    #[serde(default = "default_max_similar_frames")]
    pub max_similar_frames: usize,

    /// Frame-number distance counted as sequential, inclusive
    #[serde(default = "default_temporal_window")]
    pub temporal_window: u32,

    #[serde(default = "default_enabled_types")]
    pub enabled_types: Vec<RelationType>,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            max_similar_frames: DEFAULT_MAX_SIMILAR_FRAMES,
            temporal_window: DEFAULT_TEMPORAL_WINDOW,
            enabled_types: default_enabled_types(),
        }
    }
}

impl RelationshipConfig {
    pub fn is_enabled(&self, kind: RelationType) -> bool {
        self.enabled_types.contains(&kind)
    }
}

fn default_max_similar_frames() -> usize {
    DEFAULT_MAX_SIMILAR_FRAMES
}

fn default_temporal_window() -> u32 {
    DEFAULT_TEMPORAL_WINDOW
}

fn default_enabled_types() -> Vec<RelationType> {
    vec![
        RelationType::Similar,
        RelationType::Sequential,
        RelationType::Scene,
    ]
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_secs")]
    pub connect_backoff_secs: u64,

    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,

    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub relationships: RelationshipConfig,

    #[serde(default = "default_reporter_capacity")]
    pub reporter_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff_secs: DEFAULT_CONNECT_BACKOFF_SECS,
            uploads_dir: default_uploads_dir(),
            frames_dir: default_frames_dir(),
            queue_dir: default_queue_dir(),
            queue_poll_ms: DEFAULT_QUEUE_POLL_MS,
            extractor: ExtractorConfig::default(),
            processor: ProcessorConfig::default(),
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            relationships: RelationshipConfig::default(),
            reporter_capacity: DEFAULT_REPORTER_CAPACITY,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            base_path: PathBuf::new(),
        }
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_connect_attempts() -> u32 {
    DEFAULT_CONNECT_ATTEMPTS
}

fn default_connect_backoff_secs() -> u64 {
    DEFAULT_CONNECT_BACKOFF_SECS
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_frames_dir() -> PathBuf {
    PathBuf::from("frames")
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("queue")
}

fn default_queue_poll_ms() -> u64 {
    DEFAULT_QUEUE_POLL_MS
}

fn default_reporter_capacity() -> usize {
    DEFAULT_REPORTER_CAPACITY
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.database_url.trim().is_empty() {
            return invalid("database_url must not be empty".to_string());
        }
        if self.connect_attempts == 0 {
            return invalid("connect_attempts must be greater than 0".to_string());
        }
        if !(self.extractor.frame_rate > 0.0 && self.extractor.frame_rate.is_finite()) {
            return invalid(format!(
                "extractor.frame_rate must be positive, got {}",
                self.extractor.frame_rate
            ));
        }
        if !(1..=31).contains(&self.extractor.output_quality) {
            return invalid(format!(
                "extractor.output_quality must be between 1 and 31, got {}",
                self.extractor.output_quality
            ));
        }
        if self.processor.batch_size == 0 {
            return invalid("processor.batch_size must be greater than 0".to_string());
        }
        if self.processor.max_workers == 0 {
            return invalid("processor.max_workers must be greater than 0".to_string());
        }
        if self.index.batch_size == 0 {
            return invalid("index.batch_size must be greater than 0".to_string());
        }
        if self.index.flush_interval_ms == 0 {
            return invalid("index.flush_interval_ms must be greater than 0".to_string());
        }
        if self.embedding.dimensions == 0 {
            return invalid("embedding.dimensions must be greater than 0".to_string());
        }
        if self.embedding.provider == EmbeddingProviderKind::Histogram
            && self.embedding.dimensions % 3 != 0
        {
            return invalid(format!(
                "embedding.dimensions must be a multiple of 3 for the histogram provider, got {}",
                self.embedding.dimensions
            ));
        }
        if self.reporter_capacity == 0 {
            return invalid("reporter_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Loads `config.yaml` from `base_path`, writing the defaults first if
    /// the file does not exist yet.
    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = base_path.as_ref();
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path)?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)?;
        }

        let config_str = std::fs::read_to_string(&path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)?;
        Ok(())
    }

    /// Resolves a configured path against the base directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
