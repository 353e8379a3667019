//! Binary keypoint descriptors.
//!
//! FAST-9 corners on the luma image, strongest first, each described by 256
//! intensity comparisons inside a smoothed 31x31 patch. The comparison
//! pattern is fixed by [`PATTERN_SEED`], so descriptors of different images
//! can be matched by Hamming distance.

use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;

/// Most keypoints kept per image.
pub const MAX_KEYPOINTS: usize = 100;
/// Bytes per descriptor.
pub const DESCRIPTOR_BYTES: usize = 32;
/// Seed of the comparison pattern.
pub const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// FAST intensity threshold.
const FAST_THRESHOLD: u8 = 20;
/// Half side of the sampling patch.
const PATCH_RADIUS: u32 = 15;
/// Smoothing applied before sampling.
const BLUR_SIGMA: f32 = 2.0;

/// Pixel offsets of the two points of every comparison.
type Pattern = Vec<((i32, i32), (i32, i32))>;

fn pattern() -> Pattern {
    let mut rng = oorandom::Rand64::new(u128::from(PATTERN_SEED));
    let side = u64::from(2 * PATCH_RADIUS + 1);
    let mut offset = || rng.rand_range(0..side) as i32 - PATCH_RADIUS as i32;
    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| ((offset(), offset()), (offset(), offset())))
        .collect()
}

/// Descriptors of the strongest corners, concatenated row by row.
///
/// An image without a usable corner yields a single all-zero descriptor.
#[must_use]
pub fn binary_descriptors(gray: &GrayImage) -> Vec<u8> {
    let keypoints = strongest_corners(gray);
    if keypoints.is_empty() {
        return vec![0; DESCRIPTOR_BYTES];
    }

    let smooth = gaussian_blur_f32(gray, BLUR_SIGMA);
    let pattern = pattern();
    let mut out = Vec::with_capacity(keypoints.len() * DESCRIPTOR_BYTES);
    for corner in &keypoints {
        let (cx, cy) = (corner.x as i32, corner.y as i32);
        let sample = |(dx, dy): (i32, i32)| smooth.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0];
        for byte in pattern.chunks(8) {
            let bits = byte
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, &(p0, p1))| acc | (u8::from(sample(p0) < sample(p1)) << bit));
            out.push(bits);
        }
    }
    out
}

/// Corners whose patch fits the image, by descending score then position.
fn strongest_corners(gray: &GrayImage) -> Vec<Corner> {
    let (w, h) = gray.dimensions();
    if w <= 2 * PATCH_RADIUS || h <= 2 * PATCH_RADIUS {
        return Vec::new();
    }
    let mut corners: Vec<Corner> = corners_fast9(gray, FAST_THRESHOLD)
        .into_iter()
        .filter(|c| {
            (PATCH_RADIUS..w - PATCH_RADIUS).contains(&c.x)
                && (PATCH_RADIUS..h - PATCH_RADIUS).contains(&c.y)
        })
        .collect();
    corners.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    corners.truncate(MAX_KEYPOINTS);
    corners
}
