//! Container metadata through `ffprobe`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ExtractorConfig;
use crate::models::VideoMetadata;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffprobe failed: {0}")]
    Failed(String),

    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no video stream in {0}")]
    NoVideoStream(String),
}

/// Reads stream and container properties of a video file.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, video: &Path) -> Result<VideoMetadata, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

pub struct Ffprobe {
    path: String,
}

impl Ffprobe {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            path: config.ffprobe_path.clone(),
        }
    }
}

#[async_trait]
impl MediaProbe for Ffprobe {
    async fn probe(&self, video: &Path) -> Result<VideoMetadata, ProbeError> {
        let output = tokio::process::Command::new(&self.path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(video)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(format!(
                "{} ({})",
                stderr.trim(),
                output.status
            )));
        }

        parse_probe_output(&output.stdout)
            .map_err(|e| match e {
                ProbeError::NoVideoStream(_) => {
                    ProbeError::NoVideoStream(video.display().to_string())
                }
                other => other,
            })
    }
}

/// Metadata of the first video stream in `ffprobe -print_format json`
/// output. Duration falls back to the container's when the stream has none.
pub fn parse_probe_output(stdout: &[u8]) -> Result<VideoMetadata, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(stdout)?;

    let stream = output
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream("input".to_string()))?;

    let format = output.format;
    let duration = parse_seconds(stream.duration.as_deref())
        .or_else(|| parse_seconds(format.as_ref().and_then(|f| f.duration.as_deref())))
        .unwrap_or(0.0);

    Ok(VideoMetadata {
        duration,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        frame_rate: parse_frame_rate(stream.r_frame_rate.as_deref()).unwrap_or(0.0),
        format: format
            .as_ref()
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        size: format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    })
}

/// Parse a rate like "30000/1001" (or a plain number).
fn parse_frame_rate(rate: Option<&str>) -> Option<f64> {
    let rate = rate?;
    if let Some((num, den)) = rate.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0).then(|| num / den);
    }
    rate.parse().ok()
}

fn parse_seconds(value: Option<&str>) -> Option<f64> {
    value?.parse::<f64>().ok().filter(|s| s.is_finite() && *s >= 0.0)
}
