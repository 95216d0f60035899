//! Intensity histograms of probe images.
//!
//! Histograms always have 256 bins over 8-bit intensities. Images with a deeper
//! bit depth are scaled down to 8 bits before binning. Several images taken for
//! the same probe channel (e.g. the two probe fields of a well) are merged by a
//! per-pixel maximum projection before the histogram is taken.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::sample::ImageRecord;

/// Number of histogram bins (one per 8-bit intensity value).
pub const BINS: usize = 256;

/// Pixel counts per 8-bit intensity value ("box").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    counts: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            counts: vec![0; BINS],
        }
    }
}

impl Histogram {
    /// Build a histogram from per-bin counts, starting at box 0.
    ///
    /// Extra counts beyond bin 255 are ignored, missing bins are zero.
    pub fn from_counts(counts: impl IntoIterator<Item = u64>) -> Self {
        let mut hist = Self::default();
        for (slot, count) in hist.counts.iter_mut().zip(counts) {
            *slot = count;
        }
        hist
    }

    /// Count 8-bit pixel values.
    pub fn from_pixels(pixels: &[u8]) -> Self {
        let mut hist = Self::default();
        for &pixel in pixels {
            hist.counts[usize::from(pixel)] += 1;
        }
        hist
    }

    /// Histogram of a grayscale image.
    pub fn from_image(image: &GrayImage) -> Self {
        Self::from_pixels(image.as_raw())
    }

    /// Raw per-bin counts.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// `(box, count)` pairs in ascending box order.
    pub fn bins(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        (0u32..).zip(self.counts.iter().copied())
    }

    /// Total number of counted pixels.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Highest non-zero box that holds at least one pixel.
    pub fn max_occupied_box(&self) -> Option<u32> {
        self.bins()
            .filter(|&(bin, count)| bin > 0 && count > 0)
            .map(|(bin, _)| bin)
            .last()
    }
}

/// Per-pixel maximum over images of equal dimensions.
///
/// Images whose dimensions differ from the first one are skipped.
/// Returns `None` for an empty input.
pub fn max_projection(images: &[GrayImage]) -> Option<GrayImage> {
    let (first, rest) = images.split_first()?;
    let mut projected = first.clone();
    for image in rest {
        if image.dimensions() != projected.dimensions() {
            warn!(
                expected = ?projected.dimensions(),
                actual = ?image.dimensions(),
                "Skipping probe image with mismatched dimensions"
            );
            continue;
        }
        for (out, pixel) in projected.pixels_mut().zip(image.pixels()) {
            out.0[0] = out.0[0].max(pixel.0[0]);
        }
    }
    Some(projected)
}

/// Decode an image file to 8-bit grayscale.
pub fn decode_gray(path: &Path) -> AppResult<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}

/// Turns probe image records into histograms keyed by probe channel id.
#[async_trait]
pub trait HistogramSource: Send + Sync {
    /// Load histograms for the channels present in `images`.
    ///
    /// Channels whose images can not be read are left out of the result.
    async fn load(&self, images: &[ImageRecord]) -> AppResult<BTreeMap<u32, Histogram>>;
}

/// Reads probe images from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFileSource;

impl ImageFileSource {
    fn load_blocking(groups: BTreeMap<u32, Vec<PathBuf>>) -> BTreeMap<u32, Histogram> {
        let mut histograms = BTreeMap::new();
        for (channel_id, paths) in groups {
            let decoded: Vec<GrayImage> = paths
                .iter()
                .filter_map(|path| match decode_gray(path) {
                    Ok(image) => Some(image),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Skipping unreadable probe image");
                        None
                    }
                })
                .collect();
            if let Some(projected) = max_projection(&decoded) {
                debug!(channel_id, images = decoded.len(), "Built probe histogram");
                histograms.insert(channel_id, Histogram::from_image(&projected));
            }
        }
        histograms
    }
}

#[async_trait]
impl HistogramSource for ImageFileSource {
    async fn load(&self, images: &[ImageRecord]) -> AppResult<BTreeMap<u32, Histogram>> {
        let mut groups: BTreeMap<u32, Vec<PathBuf>> = BTreeMap::new();
        for record in images {
            groups
                .entry(record.channel_id)
                .or_default()
                .push(record.path.clone());
        }
        let histograms = tokio::task::spawn_blocking(move || Self::load_blocking(groups)).await?;
        Ok(histograms)
    }
}

/// Fixed histograms keyed by probe channel id, for tests and benchmarks.
#[derive(Debug, Default, Clone)]
pub struct StaticHistograms {
    histograms: BTreeMap<u32, Histogram>,
}

impl StaticHistograms {
    /// Wrap a set of histograms.
    pub fn new(histograms: BTreeMap<u32, Histogram>) -> Self {
        Self { histograms }
    }
}

#[async_trait]
impl HistogramSource for StaticHistograms {
    async fn load(&self, images: &[ImageRecord]) -> AppResult<BTreeMap<u32, Histogram>> {
        if images.is_empty() {
            return Ok(self.histograms.clone());
        }
        Ok(self
            .histograms
            .iter()
            .filter(|(channel_id, _)| images.iter().any(|img| img.channel_id == **channel_id))
            .map(|(channel_id, hist)| (*channel_id, hist.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_from_pixels_counts_each_value() {
        let hist = Histogram::from_pixels(&[0, 0, 3, 255]);
        assert_eq!(hist.counts()[0], 2);
        assert_eq!(hist.counts()[3], 1);
        assert_eq!(hist.counts()[255], 1);
        assert_eq!(hist.total(), 4);
        assert_eq!(hist.counts().len(), BINS);
    }

    #[test]
    fn test_from_counts_pads_and_truncates() {
        let short = Histogram::from_counts([5, 6]);
        assert_eq!(short.counts().len(), BINS);
        assert_eq!(short.counts()[1], 6);
        assert_eq!(short.counts()[2], 0);

        let long = Histogram::from_counts(std::iter::repeat(1).take(300));
        assert_eq!(long.total(), BINS as u64);
    }

    #[test]
    fn test_max_occupied_box_ignores_bin_zero() {
        assert_eq!(Histogram::from_counts([10]).max_occupied_box(), None);
        assert_eq!(Histogram::from_counts([10, 0, 4, 0]).max_occupied_box(), Some(2));
    }

    #[test]
    fn test_max_projection_takes_pixelwise_maximum() {
        let a = GrayImage::from_pixel(2, 1, Luma([10]));
        let mut b = GrayImage::from_pixel(2, 1, Luma([5]));
        b.put_pixel(1, 0, Luma([200]));
        let odd = GrayImage::from_pixel(3, 3, Luma([255]));

        let projected = max_projection(&[a, b, odd]).unwrap();

        assert_eq!(projected.dimensions(), (2, 1));
        assert_eq!(projected.get_pixel(0, 0).0[0], 10);
        assert_eq!(projected.get_pixel(1, 0).0[0], 200);
        assert!(max_projection(&[]).is_none());
    }

    fn record(path: &Path, channel_id: u32) -> ImageRecord {
        ImageRecord {
            path: path.to_path_buf(),
            plate_name: "00".to_string(),
            well_x: 0,
            well_y: 0,
            field_x: 0,
            field_y: 1,
            job_id: 3,
            channel_id,
            z_slice: 0,
        }
    }

    #[tokio::test]
    async fn test_image_file_source_projects_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let left = dir.path().join("left-C00.tif");
        let right = dir.path().join("right-C00.tif");
        GrayImage::from_pixel(4, 4, Luma([20])).save(&left).unwrap();
        GrayImage::from_pixel(4, 4, Luma([90])).save(&right).unwrap();
        let broken = dir.path().join("broken-C01.tif");
        std::fs::write(&broken, b"not a tiff").unwrap();

        let histograms = ImageFileSource
            .load(&[record(&left, 0), record(&right, 0), record(&broken, 1)])
            .await
            .unwrap();

        assert_eq!(histograms.len(), 1);
        assert_eq!(histograms[&0].counts()[90], 16);
        assert_eq!(histograms[&0].counts()[20], 0);
        assert!(matches!(decode_gray(&broken), Err(crate::error::FlowError::Image(_))));
    }
}
