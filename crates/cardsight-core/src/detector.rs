//! Card region proposals and quality filtering.

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CardsightError, Result};
use crate::types::{BoundingBox, DetectionCandidate};

/// Width over height of a standard trading card (63 x 88 mm).
pub const CARD_ASPECT_RATIO: f32 = 0.714;

/// Object detector that proposes card regions.
pub trait Detector: Send + Sync {
    /// Returns candidate boxes with their confidence.
    ///
    /// # Errors
    ///
    /// Implementations return `Detection` when the model fails to run.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>>;
}

/// Detector that never finds anything, so every image is identified whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        Ok(Vec::new())
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        (**self).detect(image)
    }
}

/// Thresholds applied to detector proposals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Expected width over height of a card.
    pub card_aspect_ratio: f32,
    /// Maximum relative deviation from `card_aspect_ratio`.
    pub max_ratio_error: f32,
    /// Minimum box area as a fraction of the image area.
    pub min_area_fraction: f32,
    /// Detections below this confidence are discarded.
    pub min_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            card_aspect_ratio: CARD_ASPECT_RATIO,
            max_ratio_error: 0.2,
            min_area_fraction: 0.1,
            min_confidence: 0.3,
        }
    }
}

impl DetectorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_ratio_error(mut self, error: f32) -> Self {
        self.max_ratio_error = error.max(0.0);
        self
    }

    #[must_use]
    pub fn with_min_area_fraction(mut self, fraction: f32) -> Self {
        self.min_area_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_min_confidence(mut self, confidence: f32) -> Self {
        self.min_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Checks that the aspect ratio is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a non-positive or non-finite card ratio.
    pub fn validate(&self) -> Result<()> {
        if !self.card_aspect_ratio.is_finite() || self.card_aspect_ratio <= 0.0 {
            return Err(CardsightError::InvalidConfig(format!(
                "card aspect ratio must be positive, got {}",
                self.card_aspect_ratio
            )));
        }
        Ok(())
    }
}

/// Wraps a [`Detector`] with the whole-image fallback and the quality filter.
#[derive(Debug, Clone)]
pub struct RegionDetector<D> {
    detector: D,
    config: DetectorConfig,
}

impl<D: Detector> RegionDetector<D> {
    #[must_use]
    pub fn new(detector: D, config: DetectorConfig) -> Self {
        Self { detector, config }
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Proposes candidate regions.
    ///
    /// When the detector finds nothing above `min_confidence`, a single
    /// whole-image candidate with `is_default = true` is returned.
    ///
    /// # Errors
    ///
    /// Propagates detector failures.
    pub fn propose(&self, image: &DynamicImage) -> Result<Vec<DetectionCandidate>> {
        let (width, height) = image.dimensions();
        let candidates: Vec<DetectionCandidate> = self
            .detector
            .detect(image)?
            .into_iter()
            .filter(|(_, confidence)| *confidence >= self.config.min_confidence)
            .map(|(bbox, confidence)| DetectionCandidate::detected(bbox, confidence))
            .collect();

        if candidates.is_empty() {
            debug!(width, height, "no detections, using the whole image");
            return Ok(vec![DetectionCandidate::whole_image(width, height)]);
        }
        Ok(candidates)
    }

    /// Whether a candidate is plausibly a single card.
    ///
    /// Default candidates always pass.
    #[must_use]
    pub fn is_acceptable(&self, image_size: (u32, u32), candidate: &DetectionCandidate) -> bool {
        candidate.is_default || passes_quality(&self.config, image_size, &candidate.bbox)
    }
}

fn passes_quality(config: &DetectorConfig, (width, height): (u32, u32), bbox: &BoundingBox) -> bool {
    let ratio_error =
        (bbox.aspect_ratio() - config.card_aspect_ratio).abs() / config.card_aspect_ratio;
    let image_area = f64::from(width) * f64::from(height);
    let min_area = image_area * f64::from(config.min_area_fraction);
    !(ratio_error > config.max_ratio_error || (bbox.area() as f64) < min_area)
}
