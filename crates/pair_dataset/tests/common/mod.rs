//! Shared fixtures for pair_dataset integration tests.
#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use pair_dataset::{DerivationError, ImageReader, SampleDescriptor};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write a `w`x`h` RGB PNG whose pixels encode `tag` and their position.
pub fn write_rgb(dir: &Path, name: &str, w: u32, h: u32, tag: u8) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    pattern(w, h, tag).save(&path)?;
    Ok(path)
}

pub fn pattern(w: u32, h: u32, tag: u8) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([tag, (x % 256) as u8, (y % 256) as u8]))
}

/// `count` split descriptors backed by PNGs named `img_000.png`, ...
pub fn write_split_set(
    dir: &Path,
    count: usize,
    w: u32,
    h: u32,
) -> anyhow::Result<Vec<SampleDescriptor>> {
    (0..count)
        .map(|i| {
            let path = write_rgb(dir, &format!("img_{i:03}.png"), w, h, (i * 7 % 256) as u8)?;
            Ok(SampleDescriptor::split(path))
        })
        .collect()
}

/// Descriptors pointing at files that do not exist.
pub fn missing(dir: &Path, count: usize) -> Vec<SampleDescriptor> {
    (0..count)
        .map(|i| SampleDescriptor::split(dir.join(format!("missing_{i:03}.png"))))
        .collect()
}

/// In-memory reader: the file stem's trailing number becomes the red channel.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticReader {
    pub width: u32,
    pub height: u32,
}

impl ImageReader for SyntheticReader {
    fn read(&self, path: &Path) -> Result<DynamicImage, DerivationError> {
        let tag = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.rsplit('_').next())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(DynamicImage::ImageRgb8(pattern(
            self.width,
            self.height,
            (tag % 256) as u8,
        )))
    }
}

/// Reader that stalls before every read.
#[derive(Debug, Clone, Copy)]
pub struct SlowReader {
    pub delay: Duration,
}

impl ImageReader for SlowReader {
    fn read(&self, _path: &Path) -> Result<DynamicImage, DerivationError> {
        std::thread::sleep(self.delay);
        Ok(DynamicImage::ImageRgb8(pattern(4, 4, 0)))
    }
}

pub fn synthetic_descriptors(count: usize) -> Vec<SampleDescriptor> {
    (0..count)
        .map(|i| SampleDescriptor::split(format!("/synthetic/sample_{i:04}.png")))
        .collect()
}
