//! Image quality metrics.
//!
//! All metrics are computed from the 8-bit RGB pixels of a decoded frame:
//! - brightness: mean per-pixel channel average, normalized to [0, 1]
//! - contrast: standard deviation of normalized per-pixel brightness
//! - sharpness: mean absolute horizontal channel gradient
//! - blur: mean squared 4-neighbour Laplacian of brightness over interior
//!   pixels (higher means sharper)
//! - score: equally weighted composite, clamped to [0, 1]
//!
//! Row sums are computed in parallel and folded in row order, so results do
//! not depend on thread scheduling.

use image::{DynamicImage, RgbImage};
use rayon::prelude::*;

use crate::models::QualityMetrics;

const WEIGHT_BRIGHTNESS: f64 = 0.25;
const WEIGHT_CONTRAST: f64 = 0.25;
const WEIGHT_SHARPNESS: f64 = 0.25;
const WEIGHT_BLUR: f64 = 0.25;

#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("image has no pixels")]
    EmptyImage,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QualityAnalyzer;

impl QualityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, image: &DynamicImage) -> Result<QualityMetrics, QualityError> {
        self.analyze_rgb(&image.to_rgb8())
    }

    pub fn analyze_rgb(&self, image: &RgbImage) -> Result<QualityMetrics, QualityError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(QualityError::EmptyImage);
        }

        let luma = brightness_grid(image);
        let pixel_count = luma.len() as f64;

        let brightness = luma.iter().sum::<f64>() / pixel_count / 255.0;
        let variance = luma
            .iter()
            .map(|v| {
                let d = v / 255.0 - brightness;
                d * d
            })
            .sum::<f64>()
            / pixel_count;
        let contrast = variance.sqrt();
        let sharpness = sharpness(image);
        let blur = laplacian_energy(&luma, width as usize, height as usize);

        let mut score = WEIGHT_BRIGHTNESS * brightness
            + WEIGHT_CONTRAST * contrast
            + WEIGHT_SHARPNESS * sharpness
            + WEIGHT_BLUR * (1.0 - blur);
        score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(QualityMetrics {
            brightness,
            contrast,
            sharpness,
            blur,
            score,
        })
    }
}

/// Per-pixel channel average on the 0-255 scale, row-major.
fn brightness_grid(image: &RgbImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| (p[0] as f64 + p[1] as f64 + p[2] as f64) / 3.0)
        .collect()
}

fn sharpness(image: &RgbImage) -> f64 {
    let (width, height) = image.dimensions();

    let row_sums: Vec<f64> = (0..height)
        .into_par_iter()
        .map(|y| {
            let mut sum = 0.0;
            for x in 0..width.saturating_sub(1) {
                let a = image.get_pixel(x, y);
                let b = image.get_pixel(x + 1, y);
                for c in 0..3 {
                    sum += (a[c] as f64 - b[c] as f64).abs();
                }
            }
            sum
        })
        .collect();

    row_sums.iter().sum::<f64>() / (width as f64 * height as f64 * 3.0)
}

fn laplacian_energy(luma: &[f64], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }

    let row_sums: Vec<f64> = (1..height - 1)
        .into_par_iter()
        .map(|y| {
            let mut sum = 0.0;
            for x in 1..width - 1 {
                let center = luma[y * width + x];
                let neighbours = luma[(y - 1) * width + x]
                    + luma[(y + 1) * width + x]
                    + luma[y * width + x - 1]
                    + luma[y * width + x + 1];
                let laplacian = 4.0 * center - neighbours;
                sum += laplacian * laplacian;
            }
            sum
        })
        .collect();

    row_sums.iter().sum::<f64>() / ((width - 2) * (height - 2)) as f64
}
