use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::eid::Eid;

pub const META_OBJECTS: &str = "objects";
pub const META_SCENE: &str = "scene";
pub const META_FACES: &str = "faces";
pub const META_RELATIONSHIPS: &str = "relationships";

/// Metadata keys only the pipeline itself may write.
pub const RESERVED_METADATA_KEYS: [&str; 4] =
    [META_OBJECTS, META_SCENE, META_FACES, META_RELATIONSHIPS];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("metadata key `{0}` is reserved for pipeline-written data")]
pub struct ReservedKeyError(pub String);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
    pub blur: f64,
    /// Composite score, always within [0, 1].
    pub score: f64,
}

/// One analyzed still image extracted from a video.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub id: Eid,
    pub video_id: Eid,
    pub number: u32,
    /// Offset into the video, in seconds.
    pub timestamp: f64,
    pub path: PathBuf,
    pub resolution: Resolution,
    pub quality: QualityMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    /// Written through `insert_metadata` so reserved keys stay pipeline-only
    #[serde(default)]
    pub(crate) metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(video_id: Eid, number: u32, timestamp: f64, path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Eid::new(),
            video_id,
            number,
            timestamp,
            path,
            resolution: Resolution::default(),
            quality: QualityMetrics::default(),
            vector: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Inserts a metadata entry, refusing the reserved pipeline keys.
    pub fn insert_metadata(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, ReservedKeyError> {
        let key = key.into();
        if RESERVED_METADATA_KEYS.contains(&key.as_str()) {
            return Err(ReservedKeyError(key));
        }
        Ok(self.metadata.insert(key, value))
    }

    pub(crate) fn set_reserved(&mut self, key: &'static str, value: Value) {
        debug_assert!(RESERVED_METADATA_KEYS.contains(&key));
        self.metadata.insert(key.to_string(), value);
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn scene(&self) -> Option<&str> {
        self.metadata.get(META_SCENE).and_then(Value::as_str)
    }

    /// Applies an RFC 7396 merge patch to the metadata object.
    pub(crate) fn patch_metadata(&mut self, patch: &Value) {
        let mut target = Value::Object(std::mem::take(&mut self.metadata));
        merge_patch(&mut target, patch);
        if let Value::Object(map) = target {
            self.metadata = map;
        }
        self.updated_at = Utc::now();
    }
}

/// JSON merge patch (RFC 7396).
///
/// Objects merge recursively, `null` removes a key, everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Decoded pixels of one frame, shared read-only by every analysis.
#[derive(Debug)]
pub struct FrameImage {
    pub path: PathBuf,
    pub pixels: DynamicImage,
}

impl FrameImage {
    pub fn new(path: impl AsRef<Path>, pixels: DynamicImage) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pixels,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> image::ImageResult<Self> {
        let pixels = image::open(path.as_ref())?;
        Ok(Self::new(path, pixels))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Similar,
    Sequential,
    Scene,
    ObjectBased,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Similar => "similar",
            RelationType::Sequential => "sequential",
            RelationType::Scene => "scene",
            RelationType::ObjectBased => "object_based",
        }
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similar" => Ok(RelationType::Similar),
            "sequential" => Ok(RelationType::Sequential),
            "scene" => Ok(RelationType::Scene),
            "object_based" => Ok(RelationType::ObjectBased),
            other => Err(format!("unknown relation type: {other}")),
        }
    }
}

/// Typed, directed link between two frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRelationship {
    pub frame_id: Eid,
    pub relation_type: RelationType,
    pub related_frame: Eid,
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Uploading,
    Processing,
    Complete,
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploading => "uploading",
            VideoStatus::Processing => "processing",
            VideoStatus::Complete => "complete",
            VideoStatus::Error => "error",
        }
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(VideoStatus::Uploading),
            "processing" => Ok(VideoStatus::Processing),
            "complete" => Ok(VideoStatus::Complete),
            "error" => Ok(VideoStatus::Error),
            other => Err(format!("unknown video status: {other}")),
        }
    }
}

/// Container and stream properties reported by the probe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub format: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Video {
    pub id: Eid,
    pub source: PathBuf,
    pub status: VideoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VideoMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: Eid::new(),
            source: source.into(),
            status: VideoStatus::Uploading,
            metadata: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
