//! Local image features stored next to each embedding.

use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{PrecomputeError, Result};
use crate::keypoints::binary_descriptors;

/// Side of the grayscale thumbnail the perceptual hash is computed on.
const PHASH_SIZE: usize = 32;
/// Side of the low-frequency DCT block kept in the hash.
const PHASH_BLOCK: usize = 8;

/// Hue bins (OpenCV 8-bit hue range, 0..180).
pub const HUE_BINS: usize = 180;
/// Saturation bins.
pub const SATURATION_BINS: usize = 256;

/// Perceptual hash, color histogram and keypoint descriptors of one
/// reference image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFeatures {
    /// 64-bit DCT hash as 16 hex digits.
    pub phash: String,
    /// Row-major `[hue][saturation]` histogram, min-max normalized.
    pub histogram: Vec<f32>,
    /// Concatenated 32-byte binary descriptors, at least one.
    pub descriptors: Vec<u8>,
}

impl LocalFeatures {
    /// # Errors
    ///
    /// Returns `FeatureExtraction` for an empty image.
    pub fn extract(image: &RgbImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(PrecomputeError::FeatureExtraction(
                "image has zero dimensions".into(),
            ));
        }
        let gray = luma(image);
        Ok(Self {
            phash: phash_of_luma(&gray),
            histogram: hsv_histogram(image),
            descriptors: binary_descriptors(&gray),
        })
    }
}

/// DCT perceptual hash.
///
/// The image is reduced to a 32x32 grayscale thumbnail; each bit of the hash
/// tells whether a coefficient of the top-left 8x8 DCT block is above the
/// block median.
#[must_use]
pub fn perceptual_hash(image: &RgbImage) -> String {
    phash_of_luma(&luma(image))
}

/// ITU-R 601-2 luma, as used by common hashing libraries.
fn luma(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let l = (u32::from(p[0]) * 299 + u32::from(p[1]) * 587 + u32::from(p[2]) * 114) / 1000;
        Luma([l as u8])
    })
}

fn phash_of_luma(gray: &GrayImage) -> String {
    let thumb = image::imageops::resize(
        gray,
        PHASH_SIZE as u32,
        PHASH_SIZE as u32,
        FilterType::Lanczos3,
    );

    let pixels: Vec<f64> = thumb.pixels().map(|p| f64::from(p[0])).collect();
    let coeffs = dct_2d(&pixels, PHASH_SIZE);

    let mut block = Vec::with_capacity(PHASH_BLOCK * PHASH_BLOCK);
    for row in 0..PHASH_BLOCK {
        block.extend_from_slice(&coeffs[row * PHASH_SIZE..row * PHASH_SIZE + PHASH_BLOCK]);
    }

    let mut sorted = block.clone();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    let median = (sorted[mid - 1] + sorted[mid]) / 2.0;

    let hash = block
        .iter()
        .fold(0u64, |acc, &c| (acc << 1) | u64::from(c > median));
    format!("{hash:016x}")
}

/// Unnormalized DCT-II along rows then columns of an `n x n` matrix.
fn dct_2d(values: &[f64], n: usize) -> Vec<f64> {
    let cos: Vec<f64> = (0..n * n)
        .map(|i| {
            let (k, x) = (i / n, i % n);
            (std::f64::consts::PI * k as f64 * (2 * x + 1) as f64 / (2 * n) as f64).cos()
        })
        .collect();
    let dct_1d = |input: &[f64], out: &mut [f64]| {
        for (k, o) in out.iter_mut().enumerate() {
            *o = 2.0
                * input
                    .iter()
                    .enumerate()
                    .map(|(x, v)| v * cos[k * n + x])
                    .sum::<f64>();
        }
    };

    let mut rows = vec![0.0; n * n];
    for r in 0..n {
        dct_1d(&values[r * n..(r + 1) * n], &mut rows[r * n..(r + 1) * n]);
    }

    let mut out = vec![0.0; n * n];
    let mut column = vec![0.0; n];
    let mut transformed = vec![0.0; n];
    for c in 0..n {
        for r in 0..n {
            column[r] = rows[r * n + c];
        }
        dct_1d(&column, &mut transformed);
        for r in 0..n {
            out[r * n + c] = transformed[r];
        }
    }
    out
}

/// 2-D hue/saturation histogram on the OpenCV 8-bit HSV scale.
#[must_use]
pub fn hsv_histogram(image: &RgbImage) -> Vec<f32> {
    let mut hist = vec![0f32; HUE_BINS * SATURATION_BINS];
    for p in image.pixels() {
        let (h, s) = hue_saturation(p[0], p[1], p[2]);
        hist[h * SATURATION_BINS + s] += 1.0;
    }

    let (min, max) = hist
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if range > 0.0 {
        hist.iter_mut().for_each(|v| *v = (*v - min) / range);
    } else {
        hist.iter_mut().for_each(|v| *v = 0.0);
    }
    hist
}

/// Hue in `0..180` and saturation in `0..256`.
fn hue_saturation(r: u8, g: u8, b: u8) -> (usize, usize) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = v - min;

    let s = if v > 0.0 { (255.0 * delta / v).round() } else { 0.0 };

    let h = if delta == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / delta
    } else if v == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let hue = ((h / 2.0).round() as usize) % HUE_BINS;
    let saturation = (s as usize).min(SATURATION_BINS - 1);
    (hue, saturation)
}
