//! Cross-module tests against a real SQLite database in a temp directory.

mod relationships;

use std::path::Path;
use std::time::Duration;

use image::{Rgb, RgbImage};

use crate::store::FrameStore;

pub(crate) async fn test_store(dir: &Path) -> FrameStore {
    let url = format!("sqlite://{}", dir.join("frames.db").display());
    FrameStore::connect(&url, 1, Duration::ZERO)
        .await
        .expect("test database")
}

/// Solid-colour JPEG, large enough for a couple of motion blocks.
pub(crate) fn write_jpeg(path: &Path, colour: [u8; 3]) {
    RgbImage::from_pixel(32, 32, Rgb(colour))
        .save(path)
        .expect("write test frame");
}
