//! Content statistics for a single frame and motion between frames.

use std::sync::{Arc, Mutex};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Block edge length used for motion comparison
pub const MOTION_BLOCK_SIZE: u32 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageRgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContentSummary {
    pub width: u32,
    pub height: u32,
    pub average_rgb: AverageRgb,
    pub edge_score: f64,
    pub motion_score: f64,
}

impl ContentSummary {
    /// Metadata entries written for this frame.
    pub fn into_metadata(self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "dimensions".to_string(),
            json!({"width": self.width, "height": self.height}),
        );
        map.insert(
            "color_stats".to_string(),
            json!({"average_rgb": self.average_rgb}),
        );
        map.insert("edge_score".to_string(), json!(self.edge_score));
        map.insert("motion_score".to_string(), json!(self.motion_score));
        map
    }
}

pub fn analyze_content(image: Arc<RgbImage>, motion: &MotionEstimator) -> ContentSummary {
    let (width, height) = image.dimensions();
    ContentSummary {
        width,
        height,
        average_rgb: average_rgb(&image),
        edge_score: edge_score(&image),
        motion_score: motion.estimate(Arc::clone(&image)),
    }
}

pub fn average_rgb(image: &RgbImage) -> AverageRgb {
    let count = image.width() as f64 * image.height() as f64;
    if count == 0.0 {
        return AverageRgb::default();
    }

    let mut sums = [0f64; 3];
    for pixel in image.pixels() {
        for (sum, value) in sums.iter_mut().zip(pixel.0) {
            *sum += value as f64;
        }
    }

    AverageRgb {
        r: sums[0] / count,
        g: sums[1] / count,
        b: sums[2] / count,
    }
}

/// Mean horizontal central difference, summed over channels, for interior
/// pixels. Images narrower or shorter than 3 pixels score 0.
pub fn edge_score(image: &RgbImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut total = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let left = image.get_pixel(x - 1, y);
            let right = image.get_pixel(x + 1, y);
            for c in 0..3 {
                total += (left[c] as f64 - right[c] as f64).abs();
            }
        }
    }

    total / ((width - 2) as f64 * (height - 2) as f64)
}

/// Block-difference motion against the previously analyzed frame.
///
/// One instance is shared by every frame a processor handles. Under
/// concurrent processing "previous" is whichever frame finished its content
/// analysis last, so scores are best-effort and may vary between runs.
#[derive(Debug, Default)]
pub struct MotionEstimator {
    previous: Mutex<Option<Arc<RgbImage>>>,
}

impl MotionEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score `current` against the previous frame and make it the new
    /// previous frame. The first frame scores 0.
    pub fn estimate(&self, current: Arc<RgbImage>) -> f64 {
        // a panic elsewhere cannot leave the reference half-written
        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let score = previous
            .as_deref()
            .map(|prev| block_difference(prev, &current, MOTION_BLOCK_SIZE))
            .unwrap_or(0.0);
        *previous = Some(current);
        score
    }

    pub fn reset(&self) {
        *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Mean over whole `block`-sized tiles of the per-channel mean absolute
/// difference. Frames of different size are compared over their overlap.
pub fn block_difference(previous: &RgbImage, current: &RgbImage, block: u32) -> f64 {
    let width = previous.width().min(current.width());
    let height = previous.height().min(current.height());
    let blocks_x = width / block;
    let blocks_y = height / block;
    if blocks_x == 0 || blocks_y == 0 {
        return 0.0;
    }

    let samples = (block * block * 3) as f64;
    let mut total = 0.0;
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let mut diff = 0.0;
            for y in by * block..(by + 1) * block {
                for x in bx * block..(bx + 1) * block {
                    let a = previous.get_pixel(x, y);
                    let b = current.get_pixel(x, y);
                    for c in 0..3 {
                        diff += (a[c] as f64 - b[c] as f64).abs();
                    }
                }
            }
            total += diff / samples;
        }
    }

    total / (blocks_x * blocks_y) as f64
}
