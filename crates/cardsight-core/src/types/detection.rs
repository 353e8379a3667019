use std::fmt;

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, `(x1, y1)` inclusive, `(x2, y2)` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box covering a whole `width x height` image.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Width over height; `0.0` for a box with no height.
    #[must_use]
    pub fn aspect_ratio(&self) -> f32 {
        if self.height() == 0 {
            0.0
        } else {
            self.width() as f32 / self.height() as f32
        }
    }

    /// Clips the box to a `width x height` image.
    #[must_use]
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x1 = self.x1.min(width);
        let y1 = self.y1.min(height);
        Self {
            x1,
            y1,
            x2: self.x2.clamp(x1, width),
            y2: self.y2.clamp(y1, height),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A region proposed by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    /// Region in source image pixels.
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Detector score, `1.0` for the whole-image default.
    pub confidence: f32,
    /// `true` when the detector found nothing and the whole image is used.
    pub is_default: bool,
}

impl DetectionCandidate {
    #[must_use]
    pub fn detected(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            is_default: false,
        }
    }

    /// The whole-image fallback candidate.
    #[must_use]
    pub fn whole_image(width: u32, height: u32) -> Self {
        Self {
            bbox: BoundingBox::full(width, height),
            confidence: 1.0,
            is_default: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_geometry() {
        let b = BoundingBox::new(10, 20, 110, 160);
        assert_eq!(b.width(), 100);
        assert_eq!(b.height(), 140);
        assert_eq!(b.area(), 14_000);
        assert!((b.aspect_ratio() - 0.714).abs() < 0.001);
    }

    #[test]
    fn degenerate_box_has_zero_ratio() {
        let b = BoundingBox::new(5, 5, 50, 5);
        assert_eq!(b.height(), 0);
        assert_eq!(b.aspect_ratio(), 0.0);
        // inverted coordinates do not underflow
        assert_eq!(BoundingBox::new(50, 50, 10, 10).area(), 0);
    }

    #[test]
    fn clamp_to_image() {
        let b = BoundingBox::new(80, 90, 300, 400).clamp_to(100, 100);
        assert_eq!(b, BoundingBox::new(80, 90, 100, 100));
        let outside = BoundingBox::new(200, 200, 300, 300).clamp_to(100, 100);
        assert_eq!(outside.area(), 0);
    }

    #[test]
    fn candidate_serializes_box_field() {
        let c = DetectionCandidate::whole_image(640, 480);
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json["box"]["x2"], 640);
        assert_eq!(json["is_default"], true);
    }
}
