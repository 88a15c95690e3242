//! Frame extraction through an external `ffmpeg` process.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cancel::CancellationToken;
use crate::config::ExtractorConfig;

const DEFAULT_FRAME_RATE: f64 = 1.0;
const DEFAULT_QUALITY: u8 = 2;
/// Scene score above which a frame counts as a cut
const SCENE_THRESHOLD: f64 = 0.3;
/// Cuts closer than this (seconds) are merged
const SCENE_MIN_GAP: f64 = 0.1;

static FRAME_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^frame-(\d+)\.jpg$").expect("valid regex"));
static PTS_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"pts_time:\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"));

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("not a JPEG image: {0}")]
    InvalidFrame(PathBuf),

    #[error("invalid frame range {start}..={end}")]
    InvalidRange { start: u32, end: u32 },

    #[error("extraction cancelled")]
    Cancelled,
}

/// Inclusive range of frame numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

impl FrameRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.end).contains(&number)
    }
}

/// A frame image on disk, ready for analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedFrame {
    pub number: u32,
    /// Seconds from the start of the video.
    pub timestamp: f64,
    pub path: PathBuf,
}

/// Produces the frame images for a range of a video.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn extract_range(
        &self,
        video: &Path,
        out_dir: &Path,
        range: FrameRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedFrame>, ExtractError>;
}

pub struct FfmpegExtractor {
    ffmpeg_path: String,
    frame_rate: f64,
    quality: u8,
}

impl FfmpegExtractor {
    /// Out-of-range settings fall back to the defaults (1 fps, quality 2).
    pub fn new(config: &ExtractorConfig) -> Self {
        let frame_rate = if config.frame_rate > 0.0 && config.frame_rate.is_finite() {
            config.frame_rate
        } else {
            DEFAULT_FRAME_RATE
        };
        let quality = if (1..=31).contains(&config.output_quality) {
            config.output_quality
        } else {
            DEFAULT_QUALITY
        };

        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            frame_rate,
            quality,
        }
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn range_args(&self, video: &Path, out_dir: &Path, range: FrameRange) -> Vec<String> {
        let start_time = range.start as f64 / self.frame_rate;
        let duration = range.len() as f64 / self.frame_rate;

        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", start_time),
            "-t".to_string(),
            format!("{:.3}", duration),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("fps={}", self.frame_rate),
            "-frames:v".to_string(),
            range.len().to_string(),
            "-q:v".to_string(),
            self.quality.to_string(),
            "-start_number".to_string(),
            range.start.to_string(),
            out_dir.join("frame-%d.jpg").to_string_lossy().to_string(),
        ]
    }

    /// Run ffmpeg, killing it if `cancel` fires first.
    async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<Output, ExtractError> {
        let mut command = tokio::process::Command::new(&self.ffmpeg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("running {} {}", self.ffmpeg_path, args.join(" "));

        let output = tokio::select! {
            output = command.output() => output.map_err(ExtractError::Spawn)?,
            _ = cancel.cancelled() => {
                // dropping the output future kills the child
                log::warn!("ffmpeg cancelled");
                return Err(ExtractError::Cancelled);
            }
        };

        Ok(output)
    }

    fn check_status(output: &Output) -> Result<(), ExtractError> {
        if output.status.success() {
            return Ok(());
        }
        Err(ExtractError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Detect scene cuts and write one `keyframe-<i>.jpg` per cut.
    pub async fn extract_keyframes(
        &self,
        video: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, ExtractError> {
        tokio::fs::create_dir_all(out_dir).await?;

        let detect = vec![
            "-hide_banner".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("select='gt(scene,{})',showinfo", SCENE_THRESHOLD),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self.run(&detect, cancel).await?;
        Self::check_status(&output)?;

        let timestamps = parse_scene_timestamps(&String::from_utf8_lossy(&output.stderr));
        log::info!("{} scene cuts in {}", timestamps.len(), video.display());

        let mut keyframes = Vec::with_capacity(timestamps.len());
        for (i, timestamp) in timestamps.iter().enumerate() {
            let path = out_dir.join(format!("keyframe-{}.jpg", i));
            let args = vec![
                "-hide_banner".to_string(),
                "-loglevel".to_string(),
                "error".to_string(),
                "-y".to_string(),
                "-ss".to_string(),
                format!("{:.3}", timestamp),
                "-i".to_string(),
                video.to_string_lossy().to_string(),
                "-frames:v".to_string(),
                "1".to_string(),
                "-q:v".to_string(),
                self.quality.to_string(),
                path.to_string_lossy().to_string(),
            ];
            let output = self.run(&args, cancel).await?;
            Self::check_status(&output)?;
            keyframes.push(path);
        }

        Ok(keyframes)
    }
}

#[async_trait]
impl FrameSource for FfmpegExtractor {
    async fn extract_range(
        &self,
        video: &Path,
        out_dir: &Path,
        range: FrameRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedFrame>, ExtractError> {
        if range.is_empty() {
            return Err(ExtractError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        tokio::fs::create_dir_all(out_dir).await?;

        let args = self.range_args(video, out_dir, range);
        let output = self.run(&args, cancel).await?;
        Self::check_status(&output)?;

        collect_frames(out_dir, range, self.frame_rate).await
    }
}

/// Gather `frame-<n>.jpg` files in `dir` with `n` inside `range`, checking
/// that each one really is a JPEG. Sorted by frame number.
pub async fn collect_frames(
    dir: &Path,
    range: FrameRange,
    frame_rate: f64,
) -> Result<Vec<ExtractedFrame>, ExtractError> {
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(number) = name
            .to_str()
            .and_then(|name| FRAME_FILE_RE.captures(name))
            .and_then(|caps| caps[1].parse::<u32>().ok())
        else {
            continue;
        };
        if !range.contains(number) {
            continue;
        }

        let path = entry.path();
        let kind = infer::get_from_path(&path)?;
        if kind.map(|k| k.mime_type()) != Some("image/jpeg") {
            return Err(ExtractError::InvalidFrame(path));
        }

        frames.push(ExtractedFrame {
            number,
            timestamp: number as f64 / frame_rate,
            path,
        });
    }

    frames.sort_by_key(|frame| frame.number);
    Ok(frames)
}

/// Timestamps of frames selected by the scene filter, sorted, with cuts
/// closer than 0.1 s merged.
pub fn parse_scene_timestamps(stderr: &str) -> Vec<f64> {
    let mut timestamps: Vec<f64> = stderr
        .lines()
        .filter(|line| line.contains("Parsed_showinfo"))
        .filter_map(|line| PTS_TIME_RE.captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .collect();

    timestamps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut merged: Vec<f64> = Vec::with_capacity(timestamps.len());
    for ts in timestamps {
        match merged.last() {
            Some(last) if ts - last < SCENE_MIN_GAP => {}
            _ => merged.push(ts),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_jpeg(path: &Path) {
        RgbImage::from_pixel(8, 8, Rgb([120, 60, 30])).save(path).unwrap();
    }

    #[test]
    fn test_settings_fall_back_to_defaults() {
        let config = ExtractorConfig {
            frame_rate: -3.0,
            output_quality: 99,
            ..ExtractorConfig::default()
        };
        let extractor = FfmpegExtractor::new(&config);
        assert_eq!(extractor.frame_rate(), 1.0);
        assert_eq!(extractor.quality, 2);
    }

    #[test]
    fn test_range_args() {
        let config = ExtractorConfig {
            frame_rate: 2.0,
            output_quality: 5,
            ..ExtractorConfig::default()
        };
        let extractor = FfmpegExtractor::new(&config);
        let args = extractor.range_args(
            Path::new("/videos/a.mp4"),
            Path::new("/frames/batch_10"),
            FrameRange::new(10, 19),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-ss 5.000 -t 5.000 -i /videos/a.mp4"));
        assert!(joined.contains("-vf fps=2 -frames:v 10 -q:v 5 -start_number 10"));
        assert!(joined.ends_with("/frames/batch_10/frame-%d.jpg"));
    }

    #[test]
    fn test_frame_range() {
        let range = FrameRange::new(100, 199);
        assert_eq!(range.len(), 100);
        assert!(range.contains(100) && range.contains(199));
        assert!(!range.contains(200));
        assert!(FrameRange::new(5, 4).is_empty());
    }

    #[tokio::test]
    async fn test_collect_frames_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for n in [12, 10, 11, 30] {
            write_jpeg(&dir.path().join(format!("frame-{n}.jpg")));
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let frames = collect_frames(dir.path(), FrameRange::new(10, 12), 2.0)
            .await
            .unwrap();
        let numbers: Vec<u32> = frames.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![10, 11, 12]);
        assert_eq!(frames[1].timestamp, 5.5);
    }

    #[tokio::test]
    async fn test_collect_frames_rejects_non_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame-1.jpg"), b"not an image").unwrap();

        let err = collect_frames(dir.path(), FrameRange::new(0, 5), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FfmpegExtractor::new(&ExtractorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extractor
            .extract_range(Path::new("missing.mp4"), dir.path(), FrameRange::new(0, 9), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Cancelled));
    }

    #[test]
    fn test_parse_scene_timestamps() {
        let stderr = "\
[Parsed_showinfo_1 @ 0x5581] n:   0 pts:  38038 pts_time:4.2     duration:1001
[Parsed_showinfo_1 @ 0x5581] n:   1 pts:  12012 pts_time:1.25    duration:1001
[Parsed_showinfo_1 @ 0x5581] n:   2 pts:  12900 pts_time:1.3     duration:1001
frame=  120 fps=0.0 q=-0.0 Lsize=N/A time=00:00:05.00
[Parsed_showinfo_1 @ 0x5581] n:   3 pts:  90000 pts_time:10      duration:1001
";
        assert_eq!(parse_scene_timestamps(stderr), vec![1.25, 4.2, 10.0]);
        assert!(parse_scene_timestamps("").is_empty());
    }
}
