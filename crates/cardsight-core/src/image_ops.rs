//! Image decoding, cropping and RGB conversion for the query path.

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::error;

use crate::error::{CardsightError, Result};
use crate::types::BoundingBox;

/// Decodes an encoded image (format sniffed from the bytes).
///
/// # Errors
///
/// Returns `InvalidImage` for empty input, undecodable bytes or an image with
/// a zero dimension.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(CardsightError::InvalidImage("empty input".into()));
    }
    let image = image::load_from_memory(bytes).map_err(|e| {
        error!("Failed to decode image: {}", e);
        CardsightError::InvalidImage(e.to_string())
    })?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CardsightError::InvalidImage(format!(
            "image has zero dimensions ({width}x{height})"
        )));
    }
    Ok(image)
}

/// Crops `image` to `bbox` clamped to its bounds; `None` if nothing is left.
#[must_use]
pub fn crop_candidate(image: &DynamicImage, bbox: &BoundingBox) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let clamped = bbox.clamp_to(width, height);
    if clamped.width() == 0 || clamped.height() == 0 {
        return None;
    }
    Some(image.crop_imm(clamped.x1, clamped.y1, clamped.width(), clamped.height()))
}

/// Converts to 8-bit RGB, compositing any alpha channel onto white.
#[must_use]
pub fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (src, dst) in rgba.pixels().zip(out.pixels_mut()) {
        let alpha = u32::from(src[3]);
        let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        *dst = Rgb([blend(src[0]), blend(src[1]), blend(src[2])]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn garbage_bytes_are_invalid() {
        assert!(matches!(
            decode_image(b"not an image"),
            Err(CardsightError::InvalidImage(_))
        ));
        assert!(matches!(decode_image(&[]), Err(CardsightError::InvalidImage(_))));
    }

    #[test]
    fn png_round_trip_decodes() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (3, 2));
    }

    #[test]
    fn crop_is_clamped() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let crop = crop_candidate(&img, &BoundingBox::new(5, 5, 50, 50)).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        assert!(crop_candidate(&img, &BoundingBox::new(20, 20, 30, 30)).is_none());
        assert!(crop_candidate(&img, &BoundingBox::new(4, 4, 4, 8)).is_none());
    }

    #[test]
    fn alpha_is_composited_onto_white() {
        let mut rgba = RgbaImage::new(3, 1);
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        rgba.put_pixel(2, 0, Rgba([0, 0, 0, 128]));
        let rgb = flatten_onto_white(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_eq!(rgb.get_pixel(2, 0), &Rgb([127, 127, 127]));
    }

    #[test]
    fn opaque_images_are_converted_directly() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(2, 2, image::Luma([90])));
        let rgb = flatten_onto_white(&img);
        assert_eq!(rgb.get_pixel(1, 1), &Rgb([90, 90, 90]));
    }
}
